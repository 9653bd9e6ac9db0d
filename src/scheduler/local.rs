use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;

use super::{
    DownloadTask, DownloadWorker, JobId, JobInfo, JobProgress, JobScheduler, JobState, ProgressSink,
};
use crate::errors::Result;
use crate::utils::write_atomically;

/// Finished jobs kept until acknowledged, at most.
pub const DEFAULT_FINISHED_RETENTION: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobEntry {
    info: JobInfo,
    task: DownloadTask,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
}

/// Drops the oldest finished jobs beyond `keep`. Live jobs are never pruned.
fn prune_finished(jobs: &mut HashMap<JobId, JobEntry>, keep: usize) -> usize {
    let mut finished: Vec<(DateTime<Utc>, JobId)> = jobs
        .values()
        .filter_map(|entry| entry.finished_at.map(|at| (at, entry.info.id)))
        .collect();
    if finished.len() <= keep {
        return 0;
    }

    finished.sort_by_key(|(at, _)| *at);
    let excess = finished.len() - keep;
    for (_, job_id) in finished.into_iter().take(excess) {
        jobs.remove(&job_id);
    }
    excess
}

struct Subscriber {
    tag: String,
    sender: mpsc::UnboundedSender<JobInfo>,
}

struct Shared {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    subscribers: Mutex<Vec<Subscriber>>,
    handles: Mutex<HashMap<JobId, JoinHandle<()>>>,
    journal: Option<PathBuf>,
    finished_retention: AtomicUsize,
}

impl Shared {
    /// Applies `update` to a live job, then journals and emits the new
    /// snapshot while still holding the job table so emission order matches
    /// mutation order. Terminal jobs are frozen.
    async fn transition<F>(&self, job_id: JobId, persist: bool, update: F) -> Option<JobInfo>
    where
        F: FnOnce(&mut JobInfo) -> bool + Send,
    {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs.get_mut(&job_id)?;
        if entry.info.state.is_terminal() || !update(&mut entry.info) {
            return None;
        }
        if entry.info.state.is_terminal() {
            entry.finished_at = Some(Utc::now());
        }
        let snapshot = entry.info.clone();

        if snapshot.state.is_terminal() {
            let pruned = prune_finished(&mut jobs, self.finished_retention.load(Ordering::Relaxed));
            if pruned > 0 {
                debug!("Pruned {} unacknowledged finished jobs", pruned);
            }
        }
        if persist {
            self.save_journal(&jobs).await;
        }
        self.emit(&snapshot).await;
        Some(snapshot)
    }

    async fn emit(&self, info: &JobInfo) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|s| s.tag != info.tag || s.sender.send(info.clone()).is_ok());
    }

    async fn save_journal(&self, jobs: &HashMap<JobId, JobEntry>) {
        let Some(path) = &self.journal else {
            return;
        };

        let entries: Vec<&JobEntry> = jobs.values().collect();
        let result = match serde_json::to_vec_pretty(&entries) {
            Ok(data) => write_atomically(path, &data).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            error!("Failed to write job journal {:?}: {}", path, e);
        }
    }
}

/// Progress handle given to workers; updates are dropped once the job left
/// the `Running` state.
pub struct ProgressReporter {
    shared: Arc<Shared>,
    job_id: JobId,
}

#[async_trait::async_trait]
impl ProgressSink for ProgressReporter {
    async fn report(&self, bytes_downloaded: u64, bytes_total: u64) {
        self.shared
            .transition(self.job_id, false, |job| {
                let progress = JobProgress { bytes_downloaded, bytes_total };
                if job.state != JobState::Running || job.progress == progress {
                    return false;
                }
                job.progress = progress;
                true
            })
            .await;
    }
}

/// In-process job queue backed by a JSON journal. Jobs that were queued or
/// running when the process died are re-queued on `open`.
pub struct LocalJobScheduler {
    shared: Arc<Shared>,
    worker: Arc<dyn DownloadWorker>,
    permits: Arc<Semaphore>,
}

impl LocalJobScheduler {
    pub fn in_memory(worker: Arc<dyn DownloadWorker>, max_concurrent: usize) -> Self {
        Self::build(worker, max_concurrent, None)
    }

    pub async fn open(
        worker: Arc<dyn DownloadWorker>,
        max_concurrent: usize,
        journal: PathBuf,
    ) -> Result<Self> {
        let entries: Vec<JobEntry> = if journal.exists() {
            let content = tokio::fs::read(&journal).await?;
            serde_json::from_slice(&content)?
        } else {
            Vec::new()
        };

        let scheduler = Self::build(worker, max_concurrent, Some(journal));
        let mut resumed = Vec::new();
        {
            let mut jobs = scheduler.shared.jobs.lock().await;
            for mut entry in entries {
                if !entry.info.state.is_terminal() {
                    entry.info.state = JobState::Queued;
                    entry.info.progress = JobProgress::default();
                    resumed.push((entry.info.id, entry.task.clone()));
                } else if entry.finished_at.is_none() {
                    entry.finished_at = Some(Utc::now());
                }
                jobs.insert(entry.info.id, entry);
            }
            prune_finished(&mut jobs, DEFAULT_FINISHED_RETENTION);
        }

        for (job_id, task) in resumed {
            info!("Resuming job {} for {}", job_id, task.media_item_id);
            scheduler.spawn_job(job_id, task).await;
        }

        Ok(scheduler)
    }

    fn build(worker: Arc<dyn DownloadWorker>, max_concurrent: usize, journal: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                handles: Mutex::new(HashMap::new()),
                journal,
                finished_retention: AtomicUsize::new(DEFAULT_FINISHED_RETENTION),
            }),
            worker,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Caps how many finished jobs nobody acknowledged are remembered.
    pub fn with_finished_retention(self, keep: usize) -> Self {
        self.shared.finished_retention.store(keep, Ordering::Relaxed);
        self
    }

    async fn spawn_job(&self, job_id: JobId, task: DownloadTask) {
        let shared = self.shared.clone();
        let worker = self.worker.clone();
        let permits = self.permits.clone();

        // Held across the spawn so the task cannot deregister itself before
        // its handle is recorded.
        let mut handles = self.shared.handles.lock().await;
        let handle = tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let started = shared
                .transition(job_id, true, |job| {
                    job.state = JobState::Running;
                    true
                })
                .await;

            if started.is_some() {
                debug!("[{}] Running job {} for {}", worker.get_name(), job_id, task.media_item_id);
                let reporter: Arc<dyn ProgressSink> = Arc::new(ProgressReporter {
                    shared: shared.clone(),
                    job_id,
                });
                let result = worker.download(&task, reporter).await;

                shared
                    .transition(job_id, true, move |job| {
                        match result {
                            Ok(byte_size) => {
                                job.state = JobState::Succeeded;
                                job.output.byte_size = Some(byte_size);
                            }
                            Err(e) => {
                                job.state = JobState::Failed;
                                job.output.error_message = Some(e.to_string());
                            }
                        }
                        true
                    })
                    .await;
            }

            shared.handles.lock().await.remove(&job_id);
        });
        handles.insert(job_id, handle);
    }
}

#[async_trait::async_trait]
impl JobScheduler for LocalJobScheduler {
    async fn submit(&self, tag: &str, task: DownloadTask) -> Result<JobId> {
        let job_id = JobId::new();
        let entry = JobEntry {
            info: JobInfo::new(job_id, tag, task.media_item_id.clone()),
            task: task.clone(),
            finished_at: None,
        };

        {
            let mut jobs = self.shared.jobs.lock().await;
            let snapshot = entry.info.clone();
            jobs.insert(job_id, entry);
            self.shared.save_journal(&jobs).await;
            self.shared.emit(&snapshot).await;
        }

        self.spawn_job(job_id, task).await;
        Ok(job_id)
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        let cancelled = self
            .shared
            .transition(job_id, true, |job| {
                job.state = JobState::Cancelled;
                true
            })
            .await;

        if cancelled.is_none() {
            debug!("Cancel ignored for unknown or finished job {}", job_id);
        }

        if let Some(handle) = self.shared.handles.lock().await.remove(&job_id) {
            handle.abort();
        }
        Ok(())
    }

    async fn acknowledge(&self, job_id: JobId) -> Result<()> {
        let mut jobs = self.shared.jobs.lock().await;
        let finished = jobs
            .get(&job_id)
            .map_or(false, |entry| entry.info.state.is_terminal());
        if finished {
            jobs.remove(&job_id);
            self.shared.save_journal(&jobs).await;
            debug!("Released finished job {}", job_id);
        }
        Ok(())
    }

    async fn status_of(&self, job_id: JobId) -> Result<Option<JobInfo>> {
        let jobs = self.shared.jobs.lock().await;
        Ok(jobs.get(&job_id).map(|entry| entry.info.clone()))
    }

    async fn jobs_with_tag(&self, tag: &str) -> Result<Vec<JobInfo>> {
        let jobs = self.shared.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|entry| entry.info.tag == tag)
            .map(|entry| entry.info.clone())
            .collect())
    }

    async fn status_feed(&self, tag: &str) -> mpsc::UnboundedReceiver<JobInfo> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().await.push(Subscriber {
            tag: tag.to_string(),
            sender,
        });
        receiver
    }
}
