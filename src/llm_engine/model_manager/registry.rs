//! Model descriptor lookup

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};

use super::types::ModelDescriptor;

/// Read-only source of model metadata. Implementations may return updated
/// descriptors after a reload performed elsewhere.
pub trait ModelDescriptorStore: Send + Sync {
    fn lookup(&self, model_name: &str) -> Option<ModelDescriptor>;
}

/// Descriptor store backed by an in-process map
#[derive(Default)]
pub struct InMemoryDescriptorStore {
    models: RwLock<HashMap<String, ModelDescriptor>>,
}

impl InMemoryDescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_descriptors(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let store = Self::new();
        for descriptor in descriptors {
            store.insert(descriptor);
        }
        store
    }

    /// Register or replace a descriptor
    pub fn insert(&self, descriptor: ModelDescriptor) {
        let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());
        models.insert(descriptor.name.clone(), descriptor);
    }

    pub fn remove(&self, model_name: &str) -> Option<ModelDescriptor> {
        let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());
        models.remove(model_name)
    }

    /// Sorted model names
    pub fn names(&self) -> Vec<String> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = models.keys().cloned().collect();
        names.sort();
        names
    }

    /// Merge descriptors from a JSON array file. Entries with a name that
    /// is already registered replace the existing descriptor.
    pub fn load_json_file(&self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read descriptor file {}", path.display()))?;
        let descriptors: Vec<ModelDescriptor> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse descriptor file {}", path.display()))?;

        let count = descriptors.len();
        for descriptor in descriptors {
            self.insert(descriptor);
        }
        log::info!("Loaded {} model descriptors from {}", count, path.display());
        Ok(count)
    }
}

impl ModelDescriptorStore for InMemoryDescriptorStore {
    fn lookup(&self, model_name: &str) -> Option<ModelDescriptor> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        models.get(model_name).cloned()
    }
}
