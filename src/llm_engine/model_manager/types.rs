//! Model Manager Types

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_context_window() -> u32 {
    4096
}

fn default_max_output_tokens() -> u32 {
    1024
}

/// What the model is loaded for. Embedding models get a context that
/// exposes pooled output vectors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    #[default]
    Chat,
    Embedding,
}

/// Where the weights come from when they are not on disk yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSource {
    /// Download URL
    pub url: String,
    /// Expected SHA256 hash (hex)
    #[serde(default)]
    pub sha256: Option<String>,
    /// Destination override; defaults to `<models_dir>/<name>.gguf`
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

/// Static metadata for one model. Never mutated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    /// Model identifier
    pub name: String,
    #[serde(default)]
    pub mode: ModelMode,
    /// Context length used to size the inference context
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    /// Output token budget per generation call
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Weights already on disk; skips the download coordinator entirely
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub download: Option<DownloadSource>,
    #[serde(default)]
    pub min_client_version: Option<String>,
    #[serde(default)]
    pub max_client_version: Option<String>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: ModelMode::Chat,
            context_window: default_context_window(),
            max_output_tokens: default_max_output_tokens(),
            local_path: None,
            download: None,
            min_client_version: None,
            max_client_version: None,
        }
    }

    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn with_download(mut self, url: impl Into<String>, sha256: Option<String>) -> Self {
        self.download = Some(DownloadSource {
            url: url.into(),
            sha256,
            cache_path: None,
        });
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        if let Some(download) = self.download.as_mut() {
            download.cache_path = Some(path.into());
        }
        self
    }

    pub fn with_limits(mut self, context_window: u32, max_output_tokens: u32) -> Self {
        self.context_window = context_window;
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_mode(mut self, mode: ModelMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_client_versions(mut self, min: Option<&str>, max: Option<&str>) -> Self {
        self.min_client_version = min.map(str::to_string);
        self.max_client_version = max.map(str::to_string);
        self
    }

    pub fn expected_hash(&self) -> Option<&str> {
        self.download.as_ref().and_then(|d| d.sha256.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

/// Polling snapshot of one download record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadState {
    pub model_id: String,
    pub status: DownloadStatus,
    /// Empty unless the status is `Failed`
    pub error: String,
    pub file_path: Option<PathBuf>,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadState {
    pub(crate) fn not_started(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            status: DownloadStatus::NotStarted,
            error: String::new(),
            file_path: None,
            downloaded_bytes: 0,
            total_bytes: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Download progress in percent, when the total size is known
    pub fn percent(&self) -> Option<f32> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some(((self.downloaded_bytes as f64 / total as f64) * 100.0).min(100.0) as f32)
            }
            _ => None,
        }
    }
}
