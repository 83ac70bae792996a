//! Model acquisition
//!
//! Module structure:
//! - types.rs: ModelDescriptor, DownloadStatus, DownloadState
//! - registry.rs: descriptor store trait and the in-memory store
//! - version.rs: client version gate
//! - verifier.rs: SHA-256 file verification
//! - downloader.rs: HTTP transport
//! - coordinator.rs: one background download per model name

pub mod coordinator;
pub mod downloader;
pub mod registry;
pub mod types;
pub mod verifier;
pub mod version;

pub use coordinator::DownloadCoordinator;
pub use downloader::{HttpFetcher, ModelFetcher, ProgressFn};
pub use registry::{InMemoryDescriptorStore, ModelDescriptorStore};
pub use types::{DownloadSource, DownloadState, DownloadStatus, ModelDescriptor, ModelMode};
pub use verifier::{sha256_file, FileVerifier, Sha256Verifier};
pub use version::{check_client_version, compare_versions};
