// Local LLM engine - on-device model lifecycle, downloads and generation
//
// - One resident model at a time, swapped on demand
// - Background weight downloads with version gating and SHA-256 checks
// - Synchronous and streaming completions, embeddings

// Performance logging macros - exported for use by other modules
#[macro_use]
pub mod macros;

pub mod config;
pub mod llm_engine;

pub use config::EngineConfig;
pub use llm_engine::model_manager::{
    DownloadState, DownloadStatus, InMemoryDescriptorStore, ModelDescriptor, ModelDescriptorStore,
    ModelMode,
};
pub use llm_engine::{
    CompletionRequest, CompletionResponse, EmbeddingInput, EmbeddingResponse, FinishReason,
    InferenceBackend, LlmEngine, LlmError,
};
#[cfg(feature = "llama")]
pub use llm_engine::LlamaCppBackend;

/// Install the stderr logger (reads RUST_LOG, defaults to `info`).
/// Later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
