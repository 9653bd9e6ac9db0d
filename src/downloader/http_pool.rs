use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, ClientBuilder, Proxy};
use tokio::io::AsyncWriteExt;

use crate::errors::{AppError, Result};
use crate::scheduler::{DownloadTask, DownloadWorker, ProgressSink};
use crate::storage::{ArtifactStorage, FsArtifactStorage};
use crate::utils::progress_percent;

/// Progress is reported at least this often when the total is unknown.
const UNKNOWN_TOTAL_REPORT_BYTES: u64 = 1024 * 1024;

/// Shared HTTP client for stream downloads
pub struct HttpPool {
    client: Client,
}

impl HttpPool {
    pub fn new(timeout_seconds: u64, proxy_url: Option<&str>) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(timeout_seconds))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("offline-music-downloader/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true);

        if let Some(proxy_url) = proxy_url {
            log::info!("Routing downloads through proxy {}", proxy_url);
            builder = builder.proxy(Proxy::all(proxy_url)?);
        }

        Ok(Self { client: builder.build()? })
    }

    pub fn get_client(&self) -> &Client {
        &self.client
    }
}

/// Streams a task's source URL into the artifact directory. Bytes land in a
/// `.part` file that is renamed only once the stream completed.
pub struct HttpDownloadWorker {
    pool: Arc<HttpPool>,
    artifacts: Arc<FsArtifactStorage>,
}

impl HttpDownloadWorker {
    pub fn new(pool: Arc<HttpPool>, artifacts: Arc<FsArtifactStorage>) -> Self {
        Self { pool, artifacts }
    }
}

#[async_trait::async_trait]
impl DownloadWorker for HttpDownloadWorker {
    async fn download(&self, task: &DownloadTask, progress: Arc<dyn ProgressSink>) -> Result<u64> {
        log::info!("Started downloading {} from {}", task.media_item_id, task.source_url);

        let response = self
            .pool
            .get_client()
            .get(&task.source_url)
            .header("Accept", "audio/*,*/*;q=0.9")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Download(format!("HTTP error: {}", response.status())));
        }

        let partial_path = self.artifacts.partial_path_for(&task.media_item_id);
        let artifact_path = self.artifacts.path_for(&task.media_item_id);
        let downloaded = match stream_into(response, &partial_path, &artifact_path, progress.as_ref()).await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                // Nothing partial may outlive a failed download.
                if let Err(cleanup) = tokio::fs::remove_file(&partial_path).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Failed to remove {:?}: {}", partial_path, cleanup);
                    }
                }
                return Err(e);
            }
        };

        log::info!("Downloaded {} ({} bytes)", task.media_item_id, downloaded);
        Ok(downloaded)
    }

    fn get_name(&self) -> &str {
        "http"
    }
}

/// Writes the body to `partial_path` and renames it to `artifact_path` once
/// complete. The caller removes the partial file on error.
async fn stream_into(
    response: reqwest::Response,
    partial_path: &Path,
    artifact_path: &Path,
    progress: &dyn ProgressSink,
) -> Result<u64> {
    let total_size = response.content_length().unwrap_or(0);
    let mut file = tokio::fs::File::create(partial_path).await?;
    let mut downloaded = 0u64;
    let mut last_reported = 0u64;
    progress.report(0, total_size).await;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        let due = if total_size > 0 {
            progress_percent(downloaded, total_size) != progress_percent(last_reported, total_size)
        } else {
            downloaded - last_reported >= UNKNOWN_TOTAL_REPORT_BYTES
        };
        if due {
            progress.report(downloaded, total_size).await;
            last_reported = downloaded;
        }
    }
    file.flush().await?;
    drop(file);

    if total_size > 0 && downloaded != total_size {
        return Err(AppError::Download(format!(
            "Stream ended after {} of {} bytes",
            downloaded, total_size
        )));
    }

    tokio::fs::rename(partial_path, artifact_path).await?;
    Ok(downloaded)
}
