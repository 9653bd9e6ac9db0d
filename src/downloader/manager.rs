use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::broadcast::{StatusBroadcaster, StatusSubscriber};
use super::cache::StatusCache;
use super::{CacheEntry, DownloadState, DownloadingJob, Status};
use crate::errors::{AppError, Result};
use crate::models::{MediaItemId, MediaItemPlaylist, MediaItemRecord, VideoItem};
use crate::scheduler::{DownloadTask, JobId, JobInfo, JobScheduler, JobState};
use crate::security::InputValidator;
use crate::storage::{ArtifactStorage, MediaStore};

/// Scheduler tag carried by every download job.
pub const TAG_DOWNLOADING: &str = "downloading";

fn scheduling(e: AppError) -> AppError {
    match e {
        AppError::SchedulingFailure(_) => e,
        other => AppError::SchedulingFailure(other.to_string()),
    }
}

fn persistence(e: AppError) -> AppError {
    match e {
        AppError::PersistenceFailure(_) => e,
        other => AppError::PersistenceFailure(other.to_string()),
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Records whose job the scheduler no longer knows about.
    pub orphaned_records: usize,
    /// Live scheduler jobs no record refers to.
    pub orphaned_jobs: usize,
    /// Jobs that finished while nobody was listening.
    pub settled_jobs: usize,
    /// Downloaded records whose file disappeared.
    pub missing_artifacts: usize,
}

/// Tracks every download, keeps the status cache, the media store and the
/// scheduler in agreement, and publishes each transition once.
///
/// All mutations of one media item run inside that item's critical section;
/// unrelated items never wait on each other.
#[derive(Clone)]
pub struct DownloadManager {
    scheduler: Arc<dyn JobScheduler>,
    store: Arc<dyn MediaStore>,
    artifacts: Arc<dyn ArtifactStorage>,
    cache: StatusCache,
    statuses: StatusBroadcaster,
    locks: Arc<DashMap<MediaItemId, Arc<Mutex<()>>>>,
    validator: Arc<InputValidator>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DownloadManager {
    /// Builds an idle manager. Prefer [`DownloadManager::start`], which also
    /// reconciles and follows the scheduler.
    pub fn new(
        scheduler: Arc<dyn JobScheduler>,
        store: Arc<dyn MediaStore>,
        artifacts: Arc<dyn ArtifactStorage>,
        status_stream_capacity: usize,
    ) -> Self {
        Self {
            scheduler,
            store,
            artifacts,
            cache: StatusCache::new(),
            statuses: StatusBroadcaster::new(status_stream_capacity),
            locks: Arc::new(DashMap::new()),
            validator: Arc::new(InputValidator::new()),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reconciles persisted state with the scheduler, then keeps following
    /// the scheduler feed and the store until [`DownloadManager::shutdown`].
    pub async fn start(
        scheduler: Arc<dyn JobScheduler>,
        store: Arc<dyn MediaStore>,
        artifacts: Arc<dyn ArtifactStorage>,
        status_stream_capacity: usize,
    ) -> Result<Self> {
        let manager = Self::new(scheduler, store, artifacts, status_stream_capacity);

        // Subscribe before reconciling so nothing emitted meanwhile is lost.
        let feed = manager.scheduler.status_feed(TAG_DOWNLOADING).await;
        let records = manager.store.watch_records();

        let report = manager.reconcile().await?;
        info!(
            "Startup reconciliation: {} orphaned records, {} orphaned jobs, {} settled jobs, {} missing artifacts",
            report.orphaned_records, report.orphaned_jobs, report.settled_jobs, report.missing_artifacts
        );

        let mut workers = manager.workers.lock().await;
        workers.push(tokio::spawn(manager.clone().consume_feed(feed)));
        workers.push(tokio::spawn(manager.clone().follow_records(records)));
        drop(workers);

        Ok(manager)
    }

    pub async fn shutdown(&self) {
        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
    }

    fn lock_for(&self, id: &MediaItemId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the critical section of an item nobody is waiting on.
    fn release_lock(&self, id: &MediaItemId) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Items without a cache entry need no critical section until the next
    /// operation recreates it.
    fn release_if_untracked(&self, id: &MediaItemId) {
        if self.cache.get(id).is_none() {
            self.release_lock(id);
        }
    }

    /// Number of items that currently hold a critical section.
    pub fn critical_sections(&self) -> usize {
        self.locks.len()
    }

    pub async fn enqueue(&self, item: &VideoItem, playlists: &[MediaItemPlaylist]) -> Result<()> {
        self.validator.validate_media_item_id(item.id.as_str())?;
        self.validator.validate_source_url(&item.source_url)?;

        let result = self.enqueue_locked(item, playlists).await;
        self.release_if_untracked(&item.id);
        result
    }

    async fn enqueue_locked(&self, item: &VideoItem, playlists: &[MediaItemPlaylist]) -> Result<()> {
        let id = item.id.clone();
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        let previous = self.cache.get(&id);
        let tracked_job = previous.as_ref().and_then(|entry| entry.job_id);
        self.publish_entry(CacheEntry::downloading(id.clone(), tracked_job));

        if let Err(e) = self.submit_if_idle(item, playlists).await {
            warn!("Enqueue of {} failed, rolling back: {}", id, e);
            self.restore(&id, previous);
            return Err(e);
        }
        Ok(())
    }

    async fn submit_if_idle(&self, item: &VideoItem, playlists: &[MediaItemPlaylist]) -> Result<()> {
        let existing = self.store.get_record(&item.id).await.map_err(persistence)?;

        if let Some(job_id) = existing.as_ref().and_then(|record| record.job_id) {
            debug!("{} already has live job {}", item.id, job_id);
            self.cache.put(item.id.clone(), CacheEntry::downloading(item.id.clone(), Some(job_id)));
            return Ok(());
        }

        let job_id = self
            .scheduler
            .submit(TAG_DOWNLOADING, DownloadTask::from(item))
            .await
            .map_err(scheduling)?;

        let record = match existing {
            Some(mut record) => {
                record.job_id = Some(job_id);
                record.downloaded = false;
                record.last_error = None;
                record.merge_playlists(playlists);
                record.touch();
                record
            }
            None => MediaItemRecord::new(item, playlists, job_id),
        };
        self.persist_with_job(record, job_id).await?;

        info!("Enqueued {} as job {}", item.id, job_id);
        self.cache.put(item.id.clone(), CacheEntry::downloading(item.id.clone(), Some(job_id)));
        Ok(())
    }

    pub async fn retry(&self, id: &MediaItemId) -> Result<()> {
        let result = self.retry_locked(id).await;
        self.release_if_untracked(id);
        result
    }

    async fn retry_locked(&self, id: &MediaItemId) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = self
            .store
            .get_record(id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| AppError::InvalidRetryState(id.to_string()))?;

        let previous = self.cache.get(id);
        self.publish_entry(CacheEntry::downloading(id.clone(), None));

        if let Err(e) = self.resubmit(record).await {
            warn!("Retry of {} failed, rolling back: {}", id, e);
            self.restore(id, previous);
            return Err(e);
        }
        Ok(())
    }

    /// The replaced job keeps running until its successor is submitted and
    /// persisted, so a failed retry leaves the item exactly as it was.
    async fn resubmit(&self, mut record: MediaItemRecord) -> Result<()> {
        let stale = record.job_id;

        let job_id = self
            .scheduler
            .submit(TAG_DOWNLOADING, DownloadTask::from(&record))
            .await
            .map_err(scheduling)?;

        let id = record.id.clone();
        record.job_id = Some(job_id);
        record.downloaded = false;
        record.last_error = None;
        record.touch();
        self.persist_with_job(record, job_id).await?;

        info!("Retrying {} as job {}", id, job_id);
        self.cache.put(id.clone(), CacheEntry::downloading(id.clone(), Some(job_id)));

        if let Some(stale) = stale {
            // Its events no longer match the tracked job.
            self.cancel_job(&id, stale).await;
        }
        Ok(())
    }

    /// Persists a record that references a freshly submitted job. If the
    /// write fails the job is cancelled so it cannot outlive its record.
    async fn persist_with_job(&self, record: MediaItemRecord, job_id: JobId) -> Result<()> {
        let id = record.id.clone();
        if let Err(e) = self.store.upsert_record(record).await {
            self.cancel_job(&id, job_id).await;
            return Err(persistence(e));
        }
        Ok(())
    }

    /// Cancels a job the manager has stopped tracking and lets the scheduler
    /// drop it.
    async fn cancel_job(&self, id: &MediaItemId, job_id: JobId) {
        if let Err(e) = self.scheduler.cancel(job_id).await {
            warn!("Failed to cancel job {} of {}: {}", job_id, id, e);
            return;
        }
        self.acknowledge(job_id).await;
    }

    async fn acknowledge(&self, job_id: JobId) {
        if let Err(e) = self.scheduler.acknowledge(job_id).await {
            warn!("Scheduler kept finished job {}: {}", job_id, e);
        }
    }

    /// Cancels any download of `id` and deletes the media item.
    pub async fn cancel(&self, id: &MediaItemId) -> Result<()> {
        let result = self.cancel_locked(id).await;
        self.release_if_untracked(id);
        result
    }

    async fn cancel_locked(&self, id: &MediaItemId) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        self.statuses.publish(Status::not_requested(id.clone()));
        let tracked_job = self.cache.get(id).and_then(|entry| entry.job_id);
        // From here on, feed events for the old job no longer match.
        self.cache.remove(id);

        let record = self.store.get_record(id).await.map_err(persistence)?;
        let job_id = tracked_job.or_else(|| record.as_ref().and_then(|r| r.job_id));
        if let Some(job_id) = job_id {
            self.cancel_job(id, job_id).await;
        }

        self.delete_media_item(id).await?;
        info!("Cancelled download of {}", id);
        Ok(())
    }

    /// Current status from the cache, never waiting on the scheduler.
    pub fn query_status(&self, id: &MediaItemId) -> Status {
        match self.cache.get(id) {
            Some(entry) => match entry.status.state {
                DownloadState::Downloaded { .. } if !self.artifacts.exists(id) => {
                    warn!("Artifact of {} is missing, reporting it as not downloaded", id);
                    Status::not_requested(id.clone())
                }
                _ => entry.status,
            },
            None => match self.artifacts.size_of(id) {
                Some(byte_size) => Status::new(id.clone(), DownloadState::Downloaded { byte_size }),
                None => Status::not_requested(id.clone()),
            },
        }
    }

    /// Transitions published from now on. Call `query_status` first for the
    /// current value; nothing is replayed.
    pub fn observe_status_stream(&self) -> StatusSubscriber {
        self.statuses.subscribe()
    }

    pub fn observe_item(&self, id: &MediaItemId) -> StatusSubscriber {
        self.statuses.subscribe_to(id.clone())
    }

    pub async fn downloading_jobs(&self) -> Result<Vec<DownloadingJob>> {
        let records = self.store.records_with_active_job().await.map_err(persistence)?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let job_id = record.job_id?;
                Some(DownloadingJob {
                    status: self.query_status(&record.id),
                    media_item: record.to_video_item(),
                    job_id,
                })
            })
            .collect())
    }

    /// Applies one scheduler event. Events for a job the item no longer
    /// tracks are dropped.
    pub async fn handle_job_event(&self, event: JobInfo) -> Result<()> {
        let id = event.media_item_id.clone();
        let result = self.apply_if_tracked(&event).await;
        self.release_if_untracked(&id);
        result
    }

    async fn apply_if_tracked(&self, event: &JobInfo) -> Result<()> {
        let id = &event.media_item_id;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let tracked = self.cache.get(id).and_then(|entry| entry.job_id);
        if tracked != Some(event.id) {
            debug!("Ignoring {:?} of job {} for {}: not the tracked job", event.state, event.id, id);
            return Ok(());
        }
        self.apply_job_state(event).await
    }

    /// Caller holds the item's critical section. Terminal outcomes are
    /// acknowledged once recorded.
    async fn apply_job_state(&self, event: &JobInfo) -> Result<()> {
        self.record_job_state(event).await?;
        if event.state.is_terminal() {
            self.acknowledge(event.id).await;
        }
        Ok(())
    }

    async fn record_job_state(&self, event: &JobInfo) -> Result<()> {
        let id = &event.media_item_id;
        match event.state {
            JobState::Queued | JobState::Running => {
                let state = DownloadState::downloading(event.progress.bytes_downloaded, event.progress.bytes_total);
                self.set_status(id, state, Some(event.id));
            }
            JobState::Succeeded => {
                let byte_size = event
                    .output
                    .byte_size
                    .or_else(|| self.artifacts.size_of(id))
                    .unwrap_or(0);
                let updated = self
                    .update_record(id, |record| {
                        record.job_id = None;
                        record.downloaded = true;
                        record.last_error = None;
                    })
                    .await?;
                if updated {
                    info!("Downloaded {} ({} bytes)", id, byte_size);
                    self.set_status(id, DownloadState::Downloaded { byte_size }, None);
                } else {
                    self.forget(id);
                }
            }
            JobState::Failed => {
                let error_message = event.output.error_message.clone();
                let updated = self
                    .update_record(id, |record| {
                        record.job_id = None;
                        record.last_error = error_message.clone();
                    })
                    .await?;
                if updated {
                    warn!("Download of {} failed: {:?}", id, error_message);
                    self.set_status(id, DownloadState::Failed { error_message }, None);
                } else {
                    self.forget(id);
                }
            }
            JobState::Cancelled => {
                // A complete artifact outlives its job; the kept record then
                // reads as downloaded.
                let mut kept = false;
                if let Some(byte_size) = self.artifacts.size_of(id) {
                    kept = self
                        .update_record(id, |record| {
                            record.job_id = None;
                            record.downloaded = true;
                            record.last_error = None;
                        })
                        .await?;
                    if kept {
                        info!("Job of {} was cancelled after its artifact completed", id);
                        self.set_status(id, DownloadState::Downloaded { byte_size }, None);
                    }
                }
                if !kept {
                    self.store.delete_record(id).await.map_err(persistence)?;
                    self.forget(id);
                }
            }
        }
        Ok(())
    }

    /// Returns false when there is no record to update.
    async fn update_record<F>(&self, id: &MediaItemId, update: F) -> Result<bool>
    where
        F: FnOnce(&mut MediaItemRecord) + Send,
    {
        let Some(mut record) = self.store.get_record(id).await.map_err(persistence)? else {
            return Ok(false);
        };
        update(&mut record);
        record.touch();
        self.store.upsert_record(record).await.map_err(persistence)?;
        Ok(true)
    }

    /// Runs one reconciliation pass of store, scheduler and cache. Safe to
    /// repeat; a second pass without new events changes nothing.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut referenced = HashSet::new();

        let active = self.store.records_with_active_job().await.map_err(persistence)?;
        for record in active {
            let Some(job_id) = record.job_id else {
                continue;
            };
            referenced.insert(job_id);
            let result = self.reconcile_record(&record.id, job_id, &mut report).await;
            self.release_if_untracked(&record.id);
            result?;
        }

        for job in self.scheduler.jobs_with_tag(TAG_DOWNLOADING).await.map_err(scheduling)? {
            if job.state.is_terminal() || referenced.contains(&job.id) {
                continue;
            }
            let result = self.cancel_if_orphaned(&job).await;
            self.release_if_untracked(&job.media_item_id);
            if result? {
                report.orphaned_jobs += 1;
            }
        }

        let records = self.store.all_records().await.map_err(persistence)?;
        report.missing_artifacts = self.sync_cache_with_records(&records).await?;
        Ok(report)
    }

    /// Settles one record that referenced `job_id` when the listing was
    /// taken.
    async fn reconcile_record(&self, id: &MediaItemId, job_id: JobId, report: &mut ReconcileReport) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        // The listing was read without the lock; skip items that moved on.
        let current = self.store.get_record(id).await.map_err(persistence)?;
        if current.and_then(|record| record.job_id) != Some(job_id) {
            debug!("{} no longer references job {}, skipping", id, job_id);
            return Ok(());
        }

        match self.scheduler.status_of(job_id).await.map_err(scheduling)? {
            None => {
                warn!(
                    "Job {} of {} is unknown to the scheduler, deleting the orphaned item",
                    job_id, id
                );
                self.delete_media_item(id).await?;
                self.forget(id);
                report.orphaned_records += 1;
            }
            Some(info) => {
                if self.cache.get(id).and_then(|entry| entry.job_id) != Some(job_id) {
                    self.set_status(id, DownloadState::downloading(0, 0), Some(job_id));
                }
                if info.state.is_terminal() {
                    info!("Job {} of {} finished as {:?} while unobserved", job_id, id, info.state);
                    report.settled_jobs += 1;
                }
                self.apply_job_state(&info).await?;
            }
        }
        Ok(())
    }

    /// Cancels a live job unless its item's record references it. The
    /// cancelled job is left to the scheduler's retention.
    async fn cancel_if_orphaned(&self, job: &JobInfo) -> Result<bool> {
        let lock = self.lock_for(&job.media_item_id);
        let _guard = lock.lock().await;

        let record = self.store.get_record(&job.media_item_id).await.map_err(persistence)?;
        if record.and_then(|r| r.job_id) == Some(job.id) {
            return Ok(false);
        }
        warn!("Job {} of {} has no record, cancelling it", job.id, job.media_item_id);
        if let Err(e) = self.scheduler.cancel(job.id).await {
            warn!("Failed to cancel orphaned job {}: {}", job.id, e);
        }
        Ok(true)
    }

    /// Cache entry a record implies, or `None` when the record claims a
    /// download whose file is gone.
    fn entry_for_record(&self, record: &MediaItemRecord) -> Option<CacheEntry> {
        let id = record.id.clone();
        if record.job_id.is_some() {
            return Some(CacheEntry::downloading(id, record.job_id));
        }
        if record.downloaded {
            let byte_size = self.artifacts.size_of(&id)?;
            return Some(CacheEntry::new(Status::new(id, DownloadState::Downloaded { byte_size }), None));
        }
        let error_message = record.last_error.clone();
        Some(CacheEntry::new(Status::new(id, DownloadState::Failed { error_message }), None))
    }

    fn needs_sync(&self, record: &MediaItemRecord) -> bool {
        match self.cache.get(&record.id) {
            None => true,
            Some(entry) => {
                entry.job_id != record.job_id
                    || (record.downloaded && !self.artifacts.exists(&record.id))
            }
        }
    }

    /// Brings the cache in line with `records`: adds missing entries, drops
    /// entries whose record is gone, and deletes downloaded records without
    /// an artifact. Returns how many of the latter were found.
    async fn sync_cache_with_records(&self, records: &[MediaItemRecord]) -> Result<usize> {
        let mut missing_artifacts = 0;

        for record in records {
            if !self.needs_sync(record) {
                continue;
            }
            let result = self.sync_record(&record.id).await;
            self.release_if_untracked(&record.id);
            if result? {
                missing_artifacts += 1;
            }
        }

        let known: HashSet<&MediaItemId> = records.iter().map(|record| &record.id).collect();
        for id in self.cache.all_keys() {
            if known.contains(&id) {
                continue;
            }
            let result = self.drop_if_deleted(&id).await;
            self.release_if_untracked(&id);
            result?;
        }

        Ok(missing_artifacts)
    }

    /// Returns true when the record was deleted for a missing artifact.
    async fn sync_record(&self, id: &MediaItemId) -> Result<bool> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        // Re-read under the lock; a concurrent operation may have moved on.
        let Some(current) = self.store.get_record(id).await.map_err(persistence)? else {
            return Ok(false);
        };
        if !self.needs_sync(&current) {
            return Ok(false);
        }
        match self.entry_for_record(&current) {
            Some(entry) => {
                self.publish_if_changed(entry);
                Ok(false)
            }
            None => {
                warn!("Artifact of downloaded item {} is missing, deleting its record", id);
                self.store.delete_record(id).await.map_err(persistence)?;
                self.forget(id);
                Ok(true)
            }
        }
    }

    async fn drop_if_deleted(&self, id: &MediaItemId) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        if self.cache.get(id).is_none() {
            return Ok(());
        }
        if self.store.get_record(id).await.map_err(persistence)?.is_none() {
            debug!("Record of {} was deleted, dropping its status", id);
            self.forget(id);
        }
        Ok(())
    }

    async fn delete_media_item(&self, id: &MediaItemId) -> Result<()> {
        self.store.delete_record(id).await.map_err(persistence)?;
        if let Err(e) = self.artifacts.delete(id) {
            warn!("Failed to delete artifact of {}: {}", id, e);
        }
        Ok(())
    }

    fn set_status(&self, id: &MediaItemId, state: DownloadState, job_id: Option<JobId>) {
        self.publish_if_changed(CacheEntry::new(Status::new(id.clone(), state), job_id));
    }

    fn publish_if_changed(&self, entry: CacheEntry) {
        if self.cache.get(&entry.status.media_item_id).as_ref() != Some(&entry) {
            self.publish_entry(entry);
        }
    }

    fn publish_entry(&self, entry: CacheEntry) {
        let status = entry.status.clone();
        self.cache.put(status.media_item_id.clone(), entry);
        self.statuses.publish(status);
    }

    /// Removes the entry and tells observers the item is gone.
    fn forget(&self, id: &MediaItemId) {
        let had_entry = self.cache.get(id).is_some();
        self.cache.remove(id);
        if had_entry {
            self.statuses.publish(Status::not_requested(id.clone()));
        }
    }

    /// Rolls an optimistic publish back to the state before the call.
    fn restore(&self, id: &MediaItemId, previous: Option<CacheEntry>) {
        match previous {
            Some(entry) => self.publish_entry(entry),
            None => {
                self.cache.remove(id);
                self.statuses.publish(Status::not_requested(id.clone()));
            }
        }
    }

    async fn consume_feed(self, mut feed: mpsc::UnboundedReceiver<JobInfo>) {
        while let Some(event) = feed.recv().await {
            let job_id = event.id;
            if let Err(e) = self.handle_job_event(event).await {
                error!("Failed to apply scheduler event of job {}: {}", job_id, e);
            }
        }
        warn!("Scheduler status feed closed");
    }

    async fn follow_records(self, mut records: watch::Receiver<Vec<MediaItemRecord>>) {
        while records.changed().await.is_ok() {
            let snapshot = records.borrow_and_update().clone();
            if let Err(e) = self.sync_cache_with_records(&snapshot).await {
                error!("Failed to sync status cache with media store: {}", e);
            }
        }
    }

    pub fn cache(&self) -> &StatusCache {
        &self.cache
    }
}
