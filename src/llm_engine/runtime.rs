//! Native inference runtime capabilities
//!
//! The engine never touches tokenizer tables or tensor math itself. A
//! backend hands out a model handle, the model hands out inference
//! contexts, and the context runs decode batches and exposes logits and
//! pooled embeddings for the last pass.

use std::path::Path;

use anyhow::Result;

pub type Token = i32;

/// Parameters for loading model weights
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelParams {
    /// Layers to offload to an accelerator, `None` lets the runtime decide
    pub n_gpu_layers: Option<u32>,
}

/// Parameters for creating an inference context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_threads: u32,
    pub n_threads_batch: u32,
    /// Expose pooled output vectors after each decode
    pub embeddings: bool,
}

/// One batch entry: token, its position in the sequence, and whether the
/// runtime should keep logits for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: Token,
    pub pos: u32,
    pub wants_logits: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeBatch {
    entries: Vec<BatchEntry>,
}

impl DecodeBatch {
    /// Whole prompt starting at position 0, logits only on the last token
    pub fn prefill(tokens: &[Token]) -> Self {
        let last = tokens.len().saturating_sub(1);
        let entries = tokens
            .iter()
            .enumerate()
            .map(|(i, &token)| BatchEntry {
                token,
                pos: i as u32,
                wants_logits: i == last,
            })
            .collect();
        Self { entries }
    }

    /// One sampled token at `pos`, with logits
    pub fn single(token: Token, pos: u32) -> Self {
        Self {
            entries: vec![BatchEntry {
                token,
                pos,
                wants_logits: true,
            }],
        }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Entry point into a native runtime
pub trait InferenceBackend: Send + Sync {
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Box<dyn NativeModel>>;
}

/// Loaded weights plus vocabulary
pub trait NativeModel: Send {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>>;

    /// Raw bytes for one token. Multi-byte characters may be split
    /// across consecutive tokens.
    fn token_to_piece(&self, token: Token) -> Result<Vec<u8>>;

    fn eos_token(&self) -> Token;

    /// Width of the pooled embedding vector
    fn n_embd(&self) -> usize;

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn NativeContext>>;
}

/// Decoding state created from a [`NativeModel`]. Must be dropped before
/// the model it came from.
pub trait NativeContext: Send {
    fn n_ctx(&self) -> u32;

    /// Drop all cached sequence state so the next batch starts at position 0
    fn clear(&mut self);

    fn decode(&mut self, batch: &DecodeBatch) -> Result<()>;

    /// Logits for the `i`-th batch entry of the last decode, if it asked
    /// for them
    fn logits_ith(&self, i: usize) -> Option<&[f32]>;

    /// Pooled embedding of the last decode, if the context was created
    /// with `embeddings` enabled
    fn embeddings(&self) -> Option<&[f32]>;
}
