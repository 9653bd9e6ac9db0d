#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use offline_music_downloader::downloader::broadcast::StatusSubscriber;
use offline_music_downloader::downloader::manager::DownloadManager;
use offline_music_downloader::errors::{AppError, Result};
use offline_music_downloader::models::{MediaItemId, MediaItemRecord, VideoItem};
use offline_music_downloader::scheduler::{
    DownloadTask, JobId, JobInfo, JobProgress, JobScheduler, JobState,
};
use offline_music_downloader::storage::{ArtifactStorage, JsonMediaStore, MediaStore};
use offline_music_downloader::Status;

pub const WAIT: Duration = Duration::from_secs(2);

/// Scheduler double whose jobs only move when a test says so.
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<HashMap<JobId, JobInfo>>,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<JobInfo>)>>,
    submits: AtomicUsize,
    cancelled: Mutex<Vec<JobId>>,
    acknowledged: Mutex<Vec<JobId>>,
    fail_submit: AtomicBool,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<JobId> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn acknowledged(&self) -> Vec<JobId> {
        self.acknowledged.lock().unwrap().clone()
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    pub fn job(&self, job_id: JobId) -> Option<JobInfo> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    /// Makes the scheduler lose all knowledge of a job.
    pub fn forget(&self, job_id: JobId) {
        self.jobs.lock().unwrap().remove(&job_id);
    }

    /// Adds a job without going through `submit`.
    pub fn register(&self, info: JobInfo) {
        self.jobs.lock().unwrap().insert(info.id, info);
    }

    /// Records `info` as the job's latest state and feeds it to subscribers.
    pub fn emit(&self, info: JobInfo) {
        self.jobs.lock().unwrap().insert(info.id, info.clone());
        self.subscribers
            .lock()
            .unwrap()
            .retain(|(tag, sender)| *tag != info.tag || sender.send(info.clone()).is_ok());
    }

    pub fn progress(&self, job_id: JobId, bytes_downloaded: u64, bytes_total: u64) {
        self.update(job_id, |info| {
            info.state = JobState::Running;
            info.progress = JobProgress {
                bytes_downloaded,
                bytes_total,
            };
        });
    }

    pub fn succeed(&self, job_id: JobId, byte_size: u64) {
        self.update(job_id, |info| {
            info.state = JobState::Succeeded;
            info.output.byte_size = Some(byte_size);
        });
    }

    pub fn fail(&self, job_id: JobId, message: &str) {
        self.update(job_id, |info| {
            info.state = JobState::Failed;
            info.output.error_message = Some(message.to_string());
        });
    }

    fn update(&self, job_id: JobId, change: impl FnOnce(&mut JobInfo)) {
        let mut info = self.job(job_id).expect("job is known");
        change(&mut info);
        self.emit(info);
    }
}

#[async_trait::async_trait]
impl JobScheduler for ManualScheduler {
    async fn submit(&self, tag: &str, task: DownloadTask) -> Result<JobId> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(AppError::SchedulingFailure("scheduler unavailable".to_string()));
        }
        // Widen the window for racing callers.
        tokio::task::yield_now().await;
        self.submits.fetch_add(1, Ordering::SeqCst);
        let job_id = JobId::new();
        self.register(JobInfo::new(job_id, tag, task.media_item_id));
        Ok(job_id)
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        self.cancelled.lock().unwrap().push(job_id);
        if let Some(mut info) = self.job(job_id) {
            if !info.state.is_terminal() {
                info.state = JobState::Cancelled;
                self.emit(info);
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, job_id: JobId) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.get(&job_id).map_or(false, |info| info.state.is_terminal()) {
            jobs.remove(&job_id);
            self.acknowledged.lock().unwrap().push(job_id);
        }
        Ok(())
    }

    async fn status_of(&self, job_id: JobId) -> Result<Option<JobInfo>> {
        Ok(self.job(job_id))
    }

    async fn jobs_with_tag(&self, tag: &str) -> Result<Vec<JobInfo>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|info| info.tag == tag)
            .cloned()
            .collect())
    }

    async fn status_feed(&self, tag: &str) -> mpsc::UnboundedReceiver<JobInfo> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push((tag.to_string(), sender));
        receiver
    }
}

/// Artifact storage kept in a map of id to byte size.
#[derive(Default)]
pub struct MemoryArtifacts {
    files: Mutex<HashMap<MediaItemId, u64>>,
}

impl MemoryArtifacts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, id: &str, byte_size: u64) {
        self.files.lock().unwrap().insert(MediaItemId::from(id), byte_size);
    }
}

impl ArtifactStorage for MemoryArtifacts {
    fn exists(&self, id: &MediaItemId) -> bool {
        self.files.lock().unwrap().contains_key(id)
    }

    fn size_of(&self, id: &MediaItemId) -> Option<u64> {
        self.files.lock().unwrap().get(id).copied()
    }

    fn path_for(&self, id: &MediaItemId) -> PathBuf {
        PathBuf::from(format!("/memory/{}.m4a", id))
    }

    fn delete(&self, id: &MediaItemId) -> Result<()> {
        self.files.lock().unwrap().remove(id);
        Ok(())
    }
}

/// Media store whose writes can be made to fail and whose active-job
/// listing can be pinned to an older snapshot.
pub struct FlakyStore {
    inner: JsonMediaStore,
    fail_upserts: AtomicBool,
    pinned_active: Mutex<Option<Vec<MediaItemRecord>>>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: JsonMediaStore::in_memory(),
            fail_upserts: AtomicBool::new(false),
            pinned_active: Mutex::new(None),
        })
    }

    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    /// From now on `records_with_active_job` keeps answering with the
    /// records as they are right now.
    pub async fn pin_active_listing(&self) {
        let snapshot = self.inner.records_with_active_job().await.unwrap();
        *self.pinned_active.lock().unwrap() = Some(snapshot);
    }
}

#[async_trait::async_trait]
impl MediaStore for FlakyStore {
    async fn get_record(&self, id: &MediaItemId) -> Result<Option<MediaItemRecord>> {
        self.inner.get_record(id).await
    }

    async fn upsert_record(&self, record: MediaItemRecord) -> Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(AppError::PersistenceFailure("disk full".to_string()));
        }
        self.inner.upsert_record(record).await
    }

    async fn delete_record(&self, id: &MediaItemId) -> Result<()> {
        self.inner.delete_record(id).await
    }

    async fn records_with_active_job(&self) -> Result<Vec<MediaItemRecord>> {
        if let Some(pinned) = self.pinned_active.lock().unwrap().clone() {
            return Ok(pinned);
        }
        self.inner.records_with_active_job().await
    }

    async fn all_records(&self) -> Result<Vec<MediaItemRecord>> {
        self.inner.all_records().await
    }

    fn watch_records(&self) -> watch::Receiver<Vec<MediaItemRecord>> {
        self.inner.watch_records()
    }
}

pub struct Harness {
    pub manager: DownloadManager,
    pub scheduler: Arc<ManualScheduler>,
    pub store: Arc<dyn MediaStore>,
    pub artifacts: Arc<MemoryArtifacts>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(
            ManualScheduler::new(),
            Arc::new(JsonMediaStore::in_memory()),
            MemoryArtifacts::new(),
        )
        .await
    }

    pub async fn start_with(
        scheduler: Arc<ManualScheduler>,
        store: Arc<dyn MediaStore>,
        artifacts: Arc<MemoryArtifacts>,
    ) -> Self {
        let manager = DownloadManager::start(scheduler.clone(), store.clone(), artifacts.clone(), 64)
            .await
            .expect("manager starts");
        Self {
            manager,
            scheduler,
            store,
            artifacts,
        }
    }

    /// Job the persisted record of `id` points at.
    pub async fn job_of(&self, id: &str) -> JobId {
        self.store
            .get_record(&MediaItemId::from(id))
            .await
            .unwrap()
            .and_then(|record| record.job_id)
            .expect("record has a live job")
    }

    pub async fn wait_for_status(&self, id: &str, predicate: impl Fn(&Status) -> bool) -> Status {
        let id = MediaItemId::from(id);
        tokio::time::timeout(WAIT, async {
            loop {
                let status = self.manager.query_status(&id);
                if predicate(&status) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status reached in time")
    }

    pub async fn wait_for_released_locks(&self) {
        tokio::time::timeout(WAIT, async {
            while self.manager.critical_sections() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("critical sections released in time");
    }

    pub async fn wait_until_no_record(&self, id: &str) {
        let id = MediaItemId::from(id);
        tokio::time::timeout(WAIT, async {
            while self.store.get_record(&id).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("record deleted in time");
    }
}

pub fn video(id: &str) -> VideoItem {
    VideoItem {
        id: MediaItemId::from(id),
        title: format!("Track {}", id),
        author: "Artist".to_string(),
        duration_secs: Some(180),
        thumbnail_url: Some(format!("https://img.example.com/{}.jpg", id)),
        source_url: format!("https://media.example.com/{}.m4a", id),
    }
}

pub async fn next_status(subscriber: &mut StatusSubscriber) -> Status {
    tokio::time::timeout(WAIT, subscriber.recv())
        .await
        .expect("status published in time")
        .expect("stream open")
}
