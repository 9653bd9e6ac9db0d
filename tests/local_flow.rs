mod common;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{next_status, video, WAIT};
use offline_music_downloader::downloader::manager::DownloadManager;
use offline_music_downloader::downloader::DownloadState;
use offline_music_downloader::errors::{AppError, Result};
use offline_music_downloader::models::MediaItemId;
use offline_music_downloader::scheduler::{DownloadTask, DownloadWorker, LocalJobScheduler, ProgressSink};
use offline_music_downloader::storage::{ArtifactStorage, FsArtifactStorage, JsonMediaStore, MediaStore};

/// Writes a fixed payload in two chunks, or fails while `broken` is set.
struct FileWorker {
    artifacts: Arc<FsArtifactStorage>,
    broken: AtomicBool,
}

#[async_trait::async_trait]
impl DownloadWorker for FileWorker {
    async fn download(&self, task: &DownloadTask, progress: Arc<dyn ProgressSink>) -> Result<u64> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(AppError::Download("HTTP error: 503 Service Unavailable".to_string()));
        }
        progress.report(1024, 2048).await;
        progress.report(2048, 2048).await;
        tokio::fs::write(self.artifacts.path_for(&task.media_item_id), vec![1u8; 2048]).await?;
        Ok(2048)
    }

    fn get_name(&self) -> &str {
        "file"
    }
}

struct App {
    manager: DownloadManager,
    store: Arc<JsonMediaStore>,
    worker: Arc<FileWorker>,
}

async fn open_app(root: &Path, broken: bool) -> App {
    let artifacts = Arc::new(FsArtifactStorage::new(root.join("tracks"), "m4a").unwrap());
    let store = Arc::new(JsonMediaStore::open(root.join("media_items.json")).await.unwrap());
    let worker = Arc::new(FileWorker {
        artifacts: artifacts.clone(),
        broken: AtomicBool::new(broken),
    });
    let scheduler = Arc::new(
        LocalJobScheduler::open(worker.clone(), 2, root.join("jobs.json"))
            .await
            .unwrap(),
    );
    let manager = DownloadManager::start(scheduler, store.clone(), artifacts, 64)
        .await
        .unwrap();
    App { manager, store, worker }
}

async fn wait_settled(manager: &DownloadManager, id: &MediaItemId) -> DownloadState {
    tokio::time::timeout(WAIT, async {
        loop {
            let status = manager.query_status(id);
            if status.state.is_settled() {
                return status.state;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("download settles in time")
}

#[tokio::test]
async fn download_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = MediaItemId::from("v1");

    let app = open_app(dir.path(), false).await;
    let mut updates = app.manager.observe_item(&id);
    app.manager.enqueue(&video("v1"), &[]).await.unwrap();

    assert!(next_status(&mut updates).await.state.is_downloading());
    assert_eq!(
        wait_settled(&app.manager, &id).await,
        DownloadState::Downloaded { byte_size: 2048 }
    );
    app.manager.shutdown().await;
    drop(app);

    let reopened = open_app(dir.path(), false).await;
    assert_eq!(
        reopened.manager.query_status(&id).state,
        DownloadState::Downloaded { byte_size: 2048 }
    );
    let record = reopened.store.get_record(&id).await.unwrap().unwrap();
    assert!(record.downloaded);
    assert_eq!(record.job_id, None);
}

#[tokio::test]
async fn failed_download_retries_after_fix() {
    let dir = tempfile::tempdir().unwrap();
    let id = MediaItemId::from("v1");

    let app = open_app(dir.path(), true).await;
    app.manager.enqueue(&video("v1"), &[]).await.unwrap();
    assert_eq!(
        wait_settled(&app.manager, &id).await,
        DownloadState::Failed {
            error_message: Some("Download error: HTTP error: 503 Service Unavailable".to_string())
        }
    );

    app.worker.broken.store(false, Ordering::SeqCst);
    app.manager.retry(&id).await.unwrap();
    assert_eq!(
        wait_settled(&app.manager, &id).await,
        DownloadState::Downloaded { byte_size: 2048 }
    );
}

#[tokio::test]
async fn deleted_artifact_is_noticed_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = MediaItemId::from("v1");

    let app = open_app(dir.path(), false).await;
    app.manager.enqueue(&video("v1"), &[]).await.unwrap();
    wait_settled(&app.manager, &id).await;
    app.manager.shutdown().await;
    drop(app);

    std::fs::remove_file(dir.path().join("tracks").join("v1.m4a")).unwrap();

    let reopened = open_app(dir.path(), false).await;
    assert_eq!(reopened.manager.query_status(&id).state, DownloadState::NotRequested);
    assert!(reopened.store.get_record(&id).await.unwrap().is_none());
}
