pub mod broadcast;
pub mod cache;
pub mod http_pool;
pub mod manager;

use serde::{Deserialize, Serialize};

use crate::models::{MediaItemId, VideoItem};
use crate::scheduler::JobId;
use crate::utils::progress_percent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadState {
    NotRequested,
    /// Fields stay zero until the scheduler reports progress.
    Downloading {
        progress_percent: u8,
        bytes_downloaded: u64,
        bytes_total: u64,
    },
    Downloaded {
        byte_size: u64,
    },
    Failed {
        error_message: Option<String>,
    },
}

impl DownloadState {
    pub fn downloading(bytes_downloaded: u64, bytes_total: u64) -> Self {
        DownloadState::Downloading {
            progress_percent: progress_percent(bytes_downloaded, bytes_total),
            bytes_downloaded,
            bytes_total,
        }
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self, DownloadState::Downloading { .. })
    }

    /// Whether no further transition happens without a new request.
    pub fn is_settled(&self) -> bool {
        !self.is_downloading()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub media_item_id: MediaItemId,
    pub state: DownloadState,
}

impl Status {
    pub fn new(media_item_id: MediaItemId, state: DownloadState) -> Self {
        Self { media_item_id, state }
    }

    pub fn not_requested(media_item_id: MediaItemId) -> Self {
        Self::new(media_item_id, DownloadState::NotRequested)
    }
}

/// Cached status plus the job currently responsible for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub status: Status,
    pub job_id: Option<JobId>,
}

impl CacheEntry {
    pub fn new(status: Status, job_id: Option<JobId>) -> Self {
        Self { status, job_id }
    }

    pub fn downloading(media_item_id: MediaItemId, job_id: Option<JobId>) -> Self {
        Self::new(Status::new(media_item_id, DownloadState::downloading(0, 0)), job_id)
    }
}

/// Item listed on the download manager screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadingJob {
    pub media_item: VideoItem,
    pub job_id: JobId,
    pub status: Status,
}
