//! Local LLM engine
//!
//! Keeps one model resident, runs completions and embeddings against it,
//! and fetches missing weights in the background.

pub mod embedding;
pub mod engine;
pub mod generation;
pub mod lifecycle;
#[cfg(feature = "llama")]
pub mod llama_backend;
pub mod model_manager;
pub mod provider;
pub mod runtime;
pub mod sampling;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::LlmEngine;
pub use generation::GenerationOutcome;
pub use lifecycle::{LifecycleManager, ResidentModel};
#[cfg(feature = "llama")]
pub use llama_backend::LlamaCppBackend;
pub use provider::{
    CompletionRequest, CompletionResponse, EmbeddingInput, EmbeddingResponse, FinishReason,
    LlmError,
};
pub use runtime::{
    BatchEntry, ContextParams, DecodeBatch, InferenceBackend, ModelParams, NativeContext,
    NativeModel, Token,
};
pub use sampling::SamplingPipeline;
