//! Download Coordinator
//!
//! One record per model name. The first caller for a name either finds an
//! unhashed file on disk (record is born `Completed`) or creates an
//! `InProgress` record and launches a job on the background runtime. The
//! job checks an existing file's hash first and only transfers when that
//! fails. Every later caller gets the same record back; terminal states
//! stay put until the process restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::downloader::ModelFetcher;
use super::types::{DownloadSource, DownloadState, DownloadStatus, ModelDescriptor};
use super::verifier::FileVerifier;
use super::version::check_client_version;

type RecordTable = Arc<Mutex<HashMap<String, DownloadState>>>;

fn lock_records(records: &RecordTable) -> MutexGuard<'_, HashMap<String, DownloadState>> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Filename-safe form of a model name
fn sanitize_model_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn part_path(target: &Path) -> PathBuf {
    let mut file_name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    file_name.push(".part");
    target.with_file_name(file_name)
}

pub struct DownloadCoordinator {
    models_dir: PathBuf,
    client_version: String,
    fetcher: Arc<dyn ModelFetcher>,
    verifier: Arc<dyn FileVerifier>,
    runtime: Handle,
    records: RecordTable,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl DownloadCoordinator {
    pub fn new(
        models_dir: PathBuf,
        client_version: impl Into<String>,
        fetcher: Arc<dyn ModelFetcher>,
        verifier: Arc<dyn FileVerifier>,
        runtime: Handle,
    ) -> Self {
        Self {
            models_dir,
            client_version: client_version.into(),
            fetcher,
            verifier,
            runtime,
            records: Arc::new(Mutex::new(HashMap::new())),
            tasks: DashMap::new(),
        }
    }

    /// Where the weights for `descriptor` are written
    pub fn target_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        descriptor
            .download
            .as_ref()
            .and_then(|d| d.cache_path.clone())
            .unwrap_or_else(|| {
                self.models_dir
                    .join(format!("{}.gguf", sanitize_model_name(&descriptor.name)))
            })
    }

    /// Snapshot of the record for `model_id`; `NotStarted` when none exists
    pub fn state(&self, model_id: &str) -> DownloadState {
        lock_records(&self.records)
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| DownloadState::not_started(model_id))
    }

    pub fn status(&self, model_id: &str) -> (DownloadStatus, String) {
        let state = self.state(model_id);
        (state.status, state.error)
    }

    pub fn has_record(&self, model_id: &str) -> bool {
        lock_records(&self.records).contains_key(model_id)
    }

    /// Returns the existing record for this model, or creates one.
    ///
    /// Only cheap filesystem checks run here, under the table lock. A file
    /// already on disk with an expected hash is checked by the background
    /// job, which skips the transfer when the hash matches.
    pub fn ensure_available(&self, descriptor: &ModelDescriptor) -> DownloadState {
        let model_id = descriptor.name.as_str();
        let mut records = lock_records(&self.records);
        if let Some(existing) = records.get(model_id) {
            return existing.clone();
        }

        let target = self.target_path(descriptor);
        let on_disk = target.exists();
        let now = Utc::now();
        let mut state = DownloadState::not_started(model_id);
        state.started_at = Some(now);
        state.file_path = Some(target.clone());

        if on_disk && descriptor.expected_hash().is_none() {
            log::info!("Model already exists: {}", target.display());
            state.status = DownloadStatus::Completed;
            state.finished_at = Some(now);
            records.insert(model_id.to_string(), state.clone());
            return state;
        }

        let source = match descriptor.download.clone() {
            Some(source) => source,
            None => {
                log::error!("Model {} has no local file and no download url", model_id);
                state.status = DownloadStatus::Failed;
                state.error = "missing download url".to_string();
                state.finished_at = Some(now);
                records.insert(model_id.to_string(), state.clone());
                return state;
            }
        };

        state.status = DownloadStatus::InProgress;
        records.insert(model_id.to_string(), state.clone());
        drop(records);

        let job = DownloadJob {
            model_id: model_id.to_string(),
            source,
            target,
            check_existing: on_disk,
            min_client_version: descriptor.min_client_version.clone(),
            max_client_version: descriptor.max_client_version.clone(),
            client_version: self.client_version.clone(),
            fetcher: Arc::clone(&self.fetcher),
            verifier: Arc::clone(&self.verifier),
            records: Arc::clone(&self.records),
        };
        if on_disk {
            log::info!("Verifying existing weights for model: {}", model_id);
        } else {
            log::info!("Starting download for model: {}", model_id);
        }
        let handle = self.runtime.spawn(job.run());
        self.tasks.insert(model_id.to_string(), handle);

        state
    }

    /// Abort every in-flight transfer. Records keep their last state.
    pub fn shutdown(&self) {
        let names: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.tasks.remove(&name) {
                if !handle.is_finished() {
                    log::info!("Aborting download for {}", name);
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for DownloadCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Everything a background transfer needs, detached from the coordinator
struct DownloadJob {
    model_id: String,
    source: DownloadSource,
    target: PathBuf,
    // The target was already on disk; check it before transferring.
    check_existing: bool,
    min_client_version: Option<String>,
    max_client_version: Option<String>,
    client_version: String,
    fetcher: Arc<dyn ModelFetcher>,
    verifier: Arc<dyn FileVerifier>,
    records: RecordTable,
}

impl DownloadJob {
    async fn run(self) {
        let outcome = self.execute().await;

        let mut records = lock_records(&self.records);
        if let Some(state) = records.get_mut(&self.model_id) {
            state.finished_at = Some(Utc::now());
            match outcome {
                Ok(()) => {
                    log::info!("Model {} is available at {}", self.model_id, self.target.display());
                    state.status = DownloadStatus::Completed;
                }
                Err(reason) => {
                    log::error!("Download failed for {}: {}", self.model_id, reason);
                    state.status = DownloadStatus::Failed;
                    state.error = reason;
                }
            }
        }
    }

    async fn execute(&self) -> Result<(), String> {
        if self.check_existing {
            if let Some(expected) = self.source.sha256.clone() {
                if self.verify(self.target.clone(), expected).await? {
                    log::info!("Model already exists and is verified: {}", self.target.display());
                    return Ok(());
                }
                log::warn!(
                    "Existing file {} failed verification, downloading again",
                    self.target.display()
                );
            }
        }

        check_client_version(
            &self.client_version,
            self.min_client_version.as_deref(),
            self.max_client_version.as_deref(),
        )
        .map_err(|e| format!("version mismatch: {}", e))?;

        if let Some(parent) = self.target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create models directory: {}", e))?;
        }

        let part = part_path(&self.target);
        let records = Arc::clone(&self.records);
        let model_id = self.model_id.clone();
        let on_progress = move |done: u64, total: Option<u64>| {
            if let Some(state) = lock_records(&records).get_mut(&model_id) {
                state.downloaded_bytes = done;
                state.total_bytes = total;
            }
        };

        log::info!("Downloading {} to {}", self.source.url, part.display());
        if let Err(e) = self.fetcher.fetch(&self.source.url, &part, &on_progress).await {
            tokio::fs::remove_file(&part).await.ok();
            return Err(format!("transfer failed: {:#}", e));
        }

        if let Some(expected) = self.source.sha256.clone() {
            if !self.verify(part.clone(), expected).await? {
                tokio::fs::remove_file(&part).await.ok();
                return Err(format!(
                    "SHA256 verification failed for {}",
                    self.target.display()
                ));
            }
        }

        tokio::fs::rename(&part, &self.target)
            .await
            .map_err(|e| format!("Failed to move download into place: {}", e))?;

        Ok(())
    }

    /// Hash `path` on the blocking pool
    async fn verify(&self, path: PathBuf, expected: String) -> Result<bool, String> {
        let verifier = Arc::clone(&self.verifier);
        tokio::task::spawn_blocking(move || verifier.verify(&path, &expected))
            .await
            .map_err(|e| format!("hash task failed: {}", e))
    }
}
