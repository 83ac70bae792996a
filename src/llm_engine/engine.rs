//! LLM Engine - single entry point for callers
//!
//! Ties the descriptor store, the download coordinator and the lifecycle
//! manager together. Generation and embedding calls block the calling
//! thread for the duration of the decode loop; async callers should run
//! them on a blocking task.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::config::EngineConfig;
use crate::llm_engine::embedding;
use crate::llm_engine::generation::{self, GenerationOutcome};
use crate::llm_engine::lifecycle::{resolve_thread_count, LifecycleManager};
use crate::llm_engine::model_manager::{
    DownloadCoordinator, DownloadState, DownloadStatus, FileVerifier, HttpFetcher, ModelFetcher,
    ModelDescriptorStore, Sha256Verifier,
};
use crate::llm_engine::provider::{
    CompletionRequest, CompletionResponse, EmbeddingInput, EmbeddingResponse, LlmError,
};
use crate::llm_engine::runtime::{InferenceBackend, ModelParams};

pub struct LlmEngine {
    config: EngineConfig,
    store: Arc<dyn ModelDescriptorStore>,
    downloads: Arc<DownloadCoordinator>,
    lifecycle: LifecycleManager,
}

impl LlmEngine {
    /// Engine with the HTTP fetcher and SHA-256 verification. Must be
    /// called from within a tokio runtime; downloads run on it.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ModelDescriptorStore>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, LlmError> {
        let runtime = Handle::try_current()
            .map_err(|e| LlmError::Config(format!("No tokio runtime for downloads: {}", e)))?;
        let fetcher = HttpFetcher::new(
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.download_timeout_secs),
        )
        .map_err(|e| LlmError::Config(format!("{:#}", e)))?;

        Ok(Self::with_parts(
            config,
            store,
            backend,
            Arc::new(fetcher),
            Arc::new(Sha256Verifier),
            runtime,
        ))
    }

    /// Engine with a custom transport and verifier
    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn ModelDescriptorStore>,
        backend: Arc<dyn InferenceBackend>,
        fetcher: Arc<dyn ModelFetcher>,
        verifier: Arc<dyn FileVerifier>,
        runtime: Handle,
    ) -> Self {
        let downloads = Arc::new(DownloadCoordinator::new(
            config.models_dir.clone(),
            config.client_version.clone(),
            fetcher,
            verifier,
            runtime,
        ));
        let n_threads = resolve_thread_count(config.n_threads);
        log::info!(
            "LLM engine ready (models_dir={}, client_version={}, threads={})",
            config.models_dir.display(),
            config.client_version,
            n_threads
        );
        let lifecycle = LifecycleManager::new(Arc::clone(&store), backend, Arc::clone(&downloads), n_threads)
            .with_model_params(ModelParams {
                n_gpu_layers: config.n_gpu_layers,
            });

        Self {
            config,
            store,
            downloads,
            lifecycle,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load `model_name` if it is not resident yet.
    /// `ModelDownloading` means try again later.
    pub fn ensure_loaded(&self, model_name: &str) -> Result<(), LlmError> {
        self.lifecycle.ensure_loaded(model_name)
    }

    /// Start acquiring the weights for `model_name` without loading them
    pub fn ensure_available(&self, model_name: &str) -> Result<DownloadState, LlmError> {
        let descriptor = self
            .store
            .lookup(model_name)
            .ok_or_else(|| LlmError::ModelNotFound(model_name.to_string()))?;
        Ok(self.downloads.ensure_available(&descriptor))
    }

    /// Full completion with token counts and finish reason
    pub fn complete(
        &self,
        model_name: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let outcome = self.run(model_name, request, |_| {})?;
        Ok(CompletionResponse {
            content: outcome.text,
            model: model_name.to_string(),
            prompt_tokens: outcome.prompt_tokens,
            completion_tokens: outcome.completion_tokens,
            finish_reason: outcome.finish_reason,
        })
    }

    pub fn generate(&self, model_name: &str, request: &CompletionRequest) -> Result<String, LlmError> {
        self.run(model_name, request, |_| {}).map(|outcome| outcome.text)
    }

    /// Like [`generate`](Self::generate), delivering each text fragment to
    /// `on_chunk` as it is produced.
    pub fn generate_stream<F>(
        &self,
        model_name: &str,
        request: &CompletionRequest,
        on_chunk: F,
    ) -> Result<(), LlmError>
    where
        F: FnMut(&str),
    {
        self.run(model_name, request, on_chunk).map(|_| ())
    }

    pub fn embed(
        &self,
        model_name: &str,
        input: impl Into<EmbeddingInput>,
    ) -> Result<EmbeddingResponse, LlmError> {
        let input = input.into();
        self.lifecycle
            .with_loaded(model_name, |resident| embedding::embed(Some(resident), model_name, &input))
    }

    pub fn download_status(&self, model_name: &str) -> (DownloadStatus, String) {
        self.downloads.status(model_name)
    }

    pub fn download_state(&self, model_name: &str) -> DownloadState {
        self.downloads.state(model_name)
    }

    pub fn current_model(&self) -> Option<String> {
        self.lifecycle.current_model()
    }

    pub fn unload(&self) -> Option<String> {
        self.lifecycle.unload()
    }

    /// Release the resident model and abort in-flight downloads
    pub fn shutdown(&self) {
        log::info!("Shutting down LLM engine");
        self.lifecycle.unload();
        self.downloads.shutdown();
    }

    fn run<F>(
        &self,
        model_name: &str,
        request: &CompletionRequest,
        on_chunk: F,
    ) -> Result<GenerationOutcome, LlmError>
    where
        F: FnMut(&str),
    {
        request.validate()?;
        self.lifecycle.with_loaded(model_name, |resident| {
            let max_output_tokens = resident.descriptor().max_output_tokens;
            let (model, context) = resident.parts();
            generation::generate(model, context, max_output_tokens, request, on_chunk)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::model_manager::coordinator::tests::{wait_for_terminal, CountingFetcher};
    use crate::llm_engine::model_manager::{InMemoryDescriptorStore, ModelDescriptor, ModelMode};
    use crate::llm_engine::provider::FinishReason;
    use crate::llm_engine::test_support::ScriptedBackend;
    use std::path::Path;
    use tempfile::tempdir;

    fn engine(dir: &Path, backend: ScriptedBackend, fetcher: Arc<CountingFetcher>) -> (LlmEngine, Arc<InMemoryDescriptorStore>) {
        let store = Arc::new(InMemoryDescriptorStore::with_descriptors([
            ModelDescriptor::new("chat").with_local_path("/models/chat.gguf"),
            ModelDescriptor::new("small").with_local_path("/models/small.gguf").with_limits(64, 2),
            ModelDescriptor::new("embed")
                .with_local_path("/models/embed.gguf")
                .with_mode(ModelMode::Embedding),
        ]));
        let config = EngineConfig::default().with_models_dir(dir).with_client_version("1.0.0");
        let engine = LlmEngine::with_parts(
            config,
            store.clone(),
            Arc::new(backend),
            fetcher,
            Arc::new(Sha256Verifier),
            Handle::current(),
        );
        (engine, store)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_complete_reports_usage() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(
            dir.path(),
            ScriptedBackend::new(&["Hello", " ", "END", " world"]),
            Arc::new(CountingFetcher::serving(b"")),
        );

        let response = engine
            .complete("chat", &CompletionRequest::new("say hi").with_stop(["END"]))
            .unwrap();
        assert_eq!(response.content, "Hello ");
        assert_eq!(response.model, "chat");
        assert_eq!(response.prompt_tokens, 6);
        assert_eq!(response.completion_tokens, 3);
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(engine.current_model(), Some("chat".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stream_matches_generate() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(
            dir.path(),
            ScriptedBackend::new(&["The", " E", "ND", " is", " near"]),
            Arc::new(CountingFetcher::serving(b"")),
        );
        let request = CompletionRequest::new("go").with_stop(["END"]);

        let text = engine.generate("chat", &request).unwrap();
        let mut chunks = Vec::new();
        engine
            .generate_stream("chat", &request, |c| chunks.push(c.to_string()))
            .unwrap();

        assert_eq!(text, "The ");
        assert_eq!(chunks.concat(), text);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_descriptor_budget_applies() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(
            dir.path(),
            ScriptedBackend::new(&["a", "b", "c"]),
            Arc::new(CountingFetcher::serving(b"")),
        );

        let response = engine
            .complete("small", &CompletionRequest::new("x").with_max_tokens(10))
            .unwrap();
        assert_eq!(response.content, "ab");
        assert_eq!(response.finish_reason, FinishReason::Length);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_request_does_not_load() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(dir.path(), ScriptedBackend::new(&[]), Arc::new(CountingFetcher::serving(b"")));

        let err = engine
            .generate("chat", &CompletionRequest::new("x").with_top_p(2.0))
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
        assert_eq!(engine.current_model(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_embed_swaps_models() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(dir.path(), ScriptedBackend::new(&["a"]), Arc::new(CountingFetcher::serving(b"")));

        engine.generate("chat", &CompletionRequest::new("x")).unwrap();
        let response = engine.embed("embed", vec!["ab".to_string(), "cd".to_string()]).unwrap();

        assert_eq!(response.model, "embed");
        assert_eq!(response.embedding.len(), 8);
        assert_eq!(response.prompt_tokens, 4);
        assert_eq!(engine.current_model(), Some("embed".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_download_status_surface() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::serving(b"remote weights"));
        let (engine, store) = engine(dir.path(), ScriptedBackend::new(&["ok"]), fetcher.clone());
        store.insert(ModelDescriptor::new("remote").with_download("http://localhost/remote.gguf", None));

        assert_eq!(engine.download_status("remote"), (DownloadStatus::NotStarted, String::new()));
        assert!(matches!(engine.ensure_available("missing"), Err(LlmError::ModelNotFound(_))));

        let err = engine.generate("remote", &CompletionRequest::new("x")).unwrap_err();
        assert!(err.is_retryable());

        wait_for_terminal(&engine.downloads, "remote").await;
        assert_eq!(engine.download_status("remote").0, DownloadStatus::Completed);
        assert_eq!(engine.download_state("remote").downloaded_bytes, 14);
        assert_eq!(engine.generate("remote", &CompletionRequest::new("x")).unwrap(), "ok");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_releases_model() {
        let dir = tempdir().unwrap();
        let backend = ScriptedBackend::new(&[]);
        let events = backend.events.clone();
        let (engine, _) = engine(dir.path(), backend, Arc::new(CountingFetcher::serving(b"")));

        engine.ensure_loaded("chat").unwrap();
        engine.shutdown();

        assert_eq!(engine.current_model(), None);
        assert_eq!(events.events(), vec!["load:chat", "context:chat", "drop_context:chat", "drop_model:chat"]);
    }
}
