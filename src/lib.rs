pub mod commands;
pub mod config;
pub mod downloader;
pub mod errors;
pub mod models;
pub mod scheduler;
pub mod security;
pub mod storage;
pub mod utils;

pub use config::AppConfig;
pub use downloader::manager::{DownloadManager, ReconcileReport};
pub use downloader::{DownloadState, DownloadingJob, Status};
pub use errors::{AppError, Result};
pub use models::{MediaItemId, MediaItemPlaylist, MediaItemRecord, VideoItem};
