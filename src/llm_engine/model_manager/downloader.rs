//! Model transfer over HTTP

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

/// Progress callback: bytes written so far, total when the server sent one
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Transport used by the download coordinator. Writes the remote resource
/// to `dest` and returns the number of bytes written.
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path, on_progress: &ProgressFn) -> Result<u64>;
}

/// Streaming reqwest transport
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ModelFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path, on_progress: &ProgressFn) -> Result<u64> {
        log::info!("Sending GET request to: {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to start download: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!("Download failed with status: {}", response.status()));
        }

        let total_size = response.content_length();
        log::info!(
            "Response successful, content length: {}",
            total_size
                .map(|t| format!("{} bytes ({:.1} MB)", t, t as f64 / (1024.0 * 1024.0)))
                .unwrap_or_else(|| "unknown".to_string())
        );

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create file {}", dest.display()))?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        on_progress(0, total_size);

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| anyhow!("Download error: {}", e))?;

            file.write_all(&chunk)
                .await
                .map_err(|e| anyhow!("Failed to write chunk: {}", e))?;

            downloaded += chunk.len() as u64;
            perf_trace!("Downloaded {} bytes from {}", downloaded, url);
            on_progress(downloaded, total_size);
        }

        file.flush()
            .await
            .map_err(|e| anyhow!("Failed to flush file: {}", e))?;

        Ok(downloaded)
    }
}
