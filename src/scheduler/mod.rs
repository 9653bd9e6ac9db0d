pub mod local;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::models::{MediaItemId, MediaItemRecord, VideoItem};

pub use local::LocalJobScheduler;

/// Scheduler-issued handle of a single download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub byte_size: Option<u64>,
    pub error_message: Option<String>,
}

/// Input data handed to the worker that executes a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub media_item_id: MediaItemId,
    pub source_url: String,
    pub thumbnail_url: Option<String>,
}

impl From<&VideoItem> for DownloadTask {
    fn from(item: &VideoItem) -> Self {
        Self {
            media_item_id: item.id.clone(),
            source_url: item.source_url.clone(),
            thumbnail_url: item.thumbnail_url.clone(),
        }
    }
}

impl From<&MediaItemRecord> for DownloadTask {
    fn from(record: &MediaItemRecord) -> Self {
        Self {
            media_item_id: record.id.clone(),
            source_url: record.source_url.clone(),
            thumbnail_url: record.thumbnail_url.clone(),
        }
    }
}

/// Snapshot of a job as known to the scheduler. The status feed yields one
/// of these per lifecycle or progress change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub tag: String,
    /// Copied from the job's input data so observers can route events.
    pub media_item_id: MediaItemId,
    pub state: JobState,
    pub progress: JobProgress,
    pub output: JobOutput,
}

impl JobInfo {
    pub fn new(id: JobId, tag: &str, media_item_id: MediaItemId) -> Self {
        Self {
            id,
            tag: tag.to_string(),
            media_item_id,
            state: JobState::Queued,
            progress: JobProgress::default(),
            output: JobOutput::default(),
        }
    }
}

/// Durable background job queue. Jobs outlive the process; this is the
/// authority on whether a job is still alive.
#[async_trait::async_trait]
pub trait JobScheduler: Send + Sync {
    async fn submit(&self, tag: &str, task: DownloadTask) -> Result<JobId>;
    async fn cancel(&self, job_id: JobId) -> Result<()>;
    /// Lets the scheduler forget a finished job whose outcome has been
    /// recorded. Live and unknown jobs are left alone.
    async fn acknowledge(&self, job_id: JobId) -> Result<()>;
    /// `None` when the scheduler has no knowledge of the job.
    async fn status_of(&self, job_id: JobId) -> Result<Option<JobInfo>>;
    async fn jobs_with_tag(&self, tag: &str) -> Result<Vec<JobInfo>>;
    /// Every change of a job carrying `tag`, in emission order per job.
    async fn status_feed(&self, tag: &str) -> mpsc::UnboundedReceiver<JobInfo>;
}

/// Reports byte progress of a running job back to its scheduler.
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, bytes_downloaded: u64, bytes_total: u64);
}

/// Executes the byte-level work of a job and returns the artifact size.
#[async_trait::async_trait]
pub trait DownloadWorker: Send + Sync {
    async fn download(&self, task: &DownloadTask, progress: Arc<dyn ProgressSink>) -> Result<u64>;
    fn get_name(&self) -> &str;
}
