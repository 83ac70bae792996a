//! Engine configuration

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const ENV_MODELS_DIR: &str = "LLM_ENGINE_MODELS_DIR";
const ENV_CLIENT_VERSION: &str = "LLM_ENGINE_CLIENT_VERSION";
const ENV_THREADS: &str = "LLM_ENGINE_THREADS";
const ENV_GPU_LAYERS: &str = "LLM_ENGINE_GPU_LAYERS";

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("local-llm-engine")
        .join("models")
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_download_timeout_secs() -> u64 {
    3600
}

fn default_connect_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Where downloaded weights land unless a descriptor overrides it
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    /// Version checked against descriptor min/max client versions
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// Decode threads; host concurrency when unset
    #[serde(default)]
    pub n_threads: Option<u32>,
    /// Layers offloaded to an accelerator; the runtime decides when unset
    #[serde(default)]
    pub n_gpu_layers: Option<u32>,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            client_version: default_client_version(),
            n_threads: None,
            n_gpu_layers: None,
            download_timeout_secs: default_download_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn with_models_dir(mut self, models_dir: impl Into<PathBuf>) -> Self {
        self.models_dir = models_dir.into();
        self
    }

    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    /// Apply `LLM_ENGINE_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup(ENV_MODELS_DIR).filter(|v| !v.is_empty()) {
            self.models_dir = PathBuf::from(dir);
        }
        if let Some(version) = lookup(ENV_CLIENT_VERSION).filter(|v| !v.is_empty()) {
            self.client_version = version;
        }
        if let Some(threads) = lookup(ENV_THREADS).filter(|v| !v.is_empty()) {
            let n = threads
                .trim()
                .parse::<u32>()
                .with_context(|| format!("{} must be a positive integer, got '{}'", ENV_THREADS, threads))?;
            self.n_threads = Some(n);
        }
        if let Some(layers) = lookup(ENV_GPU_LAYERS).filter(|v| !v.is_empty()) {
            let n = layers
                .trim()
                .parse::<u32>()
                .with_context(|| format!("{} must be a non-negative integer, got '{}'", ENV_GPU_LAYERS, layers))?;
            self.n_gpu_layers = Some(n);
        }
        Ok(self)
    }
}
