//! Request, response and error types shared by the engine
//!
//! The prompt arrives already flattened; message-list handling belongs to
//! whatever adapter sits in front of the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for engine operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum LlmError {
    /// No descriptor is registered under this name
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    /// Weights are still being fetched; retry later
    #[error("Model is downloading: {0}")]
    ModelDownloading(String),
    /// Acquisition failed for this process run
    #[error("Download failed for {model}: {reason}")]
    ModelDownloadFailed { model: String, reason: String },
    /// Native model load or context creation failed
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),
    /// The resident model does not match the request target
    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),
    /// Tokenize/decode failure during a run
    #[error("Generation failed: {0}")]
    GenerationFailed(String),
    /// Invalid request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Only an in-flight download is worth retrying; everything else is
    /// terminal for the current process run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::ModelDownloading(_))
    }
}

/// Request for text completion/generation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionRequest {
    /// Prompt text, already flattened from any message list
    pub prompt: String,
    /// Maximum tokens to generate (None = descriptor budget)
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Temperature stage (omitted from the pipeline when None)
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Top-p nucleus stage (omitted from the pipeline when None)
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    /// Stop sequences
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_penalties(mut self, frequency: f32, presence: f32) -> Self {
        self.frequency_penalty = Some(frequency);
        self.presence_penalty = Some(presence);
        self
    }

    pub fn with_stop<I, S>(mut self, stop: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop = Some(stop.into_iter().map(Into::into).collect());
        self
    }

    /// Reject sampling parameters the pipeline cannot use
    pub fn validate(&self) -> Result<(), LlmError> {
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(LlmError::InvalidRequest(format!("top_p must be within [0, 1], got {}", p)));
            }
        }
        let finite = [
            ("temperature", self.temperature),
            ("frequency_penalty", self.frequency_penalty),
            ("presence_penalty", self.presence_penalty),
        ];
        for (name, value) in finite {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(LlmError::InvalidRequest(format!("{} must be finite", name)));
                }
            }
        }
        Ok(())
    }
}

/// Why a generation run ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End-of-sequence token or a stop string
    Stop,
    /// Token budget or context window exhausted
    Length,
}

/// Response from a completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text content
    pub content: String,
    /// Model that generated the response
    pub model: String,
    /// Number of tokens in the prompt
    pub prompt_tokens: u32,
    /// Number of tokens sampled (including one that hit a stop string)
    pub completion_tokens: u32,
    pub finish_reason: FinishReason,
}

/// Embedding input: a single string or a list that is joined before
/// tokenization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

impl EmbeddingInput {
    /// Text submitted to the tokenizer. Batch items are concatenated
    /// without a separator.
    pub fn joined(&self) -> String {
        match self {
            EmbeddingInput::Single(text) => text.clone(),
            EmbeddingInput::Batch(items) => items.concat(),
        }
    }
}

impl From<&str> for EmbeddingInput {
    fn from(text: &str) -> Self {
        EmbeddingInput::Single(text.to_string())
    }
}

impl From<String> for EmbeddingInput {
    fn from(text: String) -> Self {
        EmbeddingInput::Single(text)
    }
}

impl From<Vec<String>> for EmbeddingInput {
    fn from(items: Vec<String>) -> Self {
        EmbeddingInput::Batch(items)
    }
}

/// Response from an embedding request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub model: String,
    pub embedding: Vec<f32>,
    pub prompt_tokens: u32,
}
