//! Resident model lifecycle
//!
//! At most one model is loaded at a time. The slot is guarded by a single
//! mutex that is held for the whole of a load or a generation call, so a
//! swap can never pull the handles out from under a running decode.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::model_manager::{
    DownloadCoordinator, DownloadStatus, ModelDescriptor, ModelDescriptorStore, ModelMode,
};
use super::provider::LlmError;
use super::runtime::{ContextParams, InferenceBackend, ModelParams, NativeContext, NativeModel};

/// Worker threads for prefill and batch decode
pub fn resolve_thread_count(configured: Option<u32>) -> u32 {
    configured.filter(|&n| n > 0).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4)
    })
}

/// Loaded model and the one context created from it.
pub struct ResidentModel {
    name: String,
    descriptor: ModelDescriptor,
    // Field order matters: the context is dropped before the model.
    context: Box<dyn NativeContext>,
    model: Box<dyn NativeModel>,
}

impl ResidentModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub(crate) fn parts(&mut self) -> (&dyn NativeModel, &mut dyn NativeContext) {
        (self.model.as_ref(), self.context.as_mut())
    }
}

impl Drop for ResidentModel {
    fn drop(&mut self) {
        log::info!("Releasing model {}", self.name);
    }
}

pub struct LifecycleManager {
    store: Arc<dyn ModelDescriptorStore>,
    backend: Arc<dyn InferenceBackend>,
    downloads: Arc<DownloadCoordinator>,
    n_threads: u32,
    model_params: ModelParams,
    resident: Mutex<Option<ResidentModel>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn ModelDescriptorStore>,
        backend: Arc<dyn InferenceBackend>,
        downloads: Arc<DownloadCoordinator>,
        n_threads: u32,
    ) -> Self {
        Self {
            store,
            backend,
            downloads,
            n_threads,
            model_params: ModelParams::default(),
            resident: Mutex::new(None),
        }
    }

    /// Weight-loading parameters passed to the backend on every load
    pub fn with_model_params(mut self, model_params: ModelParams) -> Self {
        self.model_params = model_params;
        self
    }

    fn lock_resident(&self) -> MutexGuard<'_, Option<ResidentModel>> {
        self.resident.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `model_name` the resident model. Cheap when it already is.
    pub fn ensure_loaded(&self, model_name: &str) -> Result<(), LlmError> {
        let mut slot = self.lock_resident();
        self.load_into(&mut slot, model_name)
    }

    /// Load `model_name` if needed and run `f` against it without
    /// releasing the slot in between.
    pub fn with_loaded<T>(
        &self,
        model_name: &str,
        f: impl FnOnce(&mut ResidentModel) -> Result<T, LlmError>,
    ) -> Result<T, LlmError> {
        let mut slot = self.lock_resident();
        self.load_into(&mut slot, model_name)?;
        match slot.as_mut() {
            Some(resident) => f(resident),
            None => Err(LlmError::ModelNotLoaded(model_name.to_string())),
        }
    }

    /// Run `f` against whatever is resident, loading nothing
    #[cfg(test)]
    pub(crate) fn with_resident<T>(&self, f: impl FnOnce(Option<&mut ResidentModel>) -> T) -> T {
        let mut slot = self.lock_resident();
        f(slot.as_mut())
    }

    pub fn current_model(&self) -> Option<String> {
        self.lock_resident().as_ref().map(|r| r.name.clone())
    }

    /// Release the resident model, context first
    pub fn unload(&self) -> Option<String> {
        let previous = self.lock_resident().take();
        previous.map(|resident| {
            let name = resident.name.clone();
            drop(resident);
            name
        })
    }

    fn load_into(&self, slot: &mut Option<ResidentModel>, model_name: &str) -> Result<(), LlmError> {
        if slot.as_ref().is_some_and(|r| r.name == model_name) {
            return Ok(());
        }

        let descriptor = self
            .store
            .lookup(model_name)
            .ok_or_else(|| LlmError::ModelNotFound(model_name.to_string()))?;
        let path = self.resolve_weights(&descriptor)?;

        if let Some(previous) = slot.take() {
            log::info!("Evicting {} to load {}", previous.name, model_name);
            drop(previous);
        }

        log::info!("Loading model {} from {}", model_name, path.display());
        let model = self
            .backend
            .load_model(&path, &self.model_params)
            .map_err(|e| {
                LlmError::ModelLoadFailed(format!("{} ({}): {:#}", model_name, path.display(), e))
            })?;

        let params = ContextParams {
            n_ctx: descriptor.context_window,
            n_threads: self.n_threads,
            n_threads_batch: self.n_threads,
            embeddings: descriptor.mode == ModelMode::Embedding,
        };
        let context = match model.new_context(&params) {
            Ok(context) => context,
            Err(e) => {
                drop(model);
                return Err(LlmError::ModelLoadFailed(format!(
                    "Failed to create context for {}: {:#}",
                    model_name, e
                )));
            }
        };

        log::info!(
            "Model {} loaded (n_ctx={}, threads={})",
            model_name,
            params.n_ctx,
            self.n_threads
        );
        *slot = Some(ResidentModel {
            name: model_name.to_string(),
            descriptor,
            context,
            model,
        });
        Ok(())
    }

    /// Weights on disk for `descriptor`, going through the download
    /// coordinator when there is no local path.
    fn resolve_weights(&self, descriptor: &ModelDescriptor) -> Result<PathBuf, LlmError> {
        if let Some(path) = &descriptor.local_path {
            return Ok(path.clone());
        }

        let state = self.downloads.ensure_available(descriptor);
        match state.status {
            DownloadStatus::Completed => Ok(state
                .file_path
                .unwrap_or_else(|| self.downloads.target_path(descriptor))),
            DownloadStatus::Failed => Err(LlmError::ModelDownloadFailed {
                model: descriptor.name.clone(),
                reason: state.error,
            }),
            DownloadStatus::InProgress | DownloadStatus::NotStarted => {
                Err(LlmError::ModelDownloading(descriptor.name.clone()))
            }
        }
    }
}
