use std::sync::Arc;

use clap::Subcommand;
use log::info;

use crate::config::AppConfig;
use crate::downloader::http_pool::{HttpDownloadWorker, HttpPool};
use crate::downloader::manager::DownloadManager;
use crate::downloader::{DownloadState, Status};
use crate::errors::{AppError, Result};
use crate::models::{MediaItemId, MediaItemPlaylist, VideoItem};
use crate::scheduler::LocalJobScheduler;
use crate::security::InputValidator;
use crate::storage::{FsArtifactStorage, JsonMediaStore};
use crate::utils::ensure_dir_exists;

// State management
pub struct AppState {
    pub config: AppConfig,
    pub manager: DownloadManager,
    pub artifacts: Arc<FsArtifactStorage>,
}

impl AppState {
    /// Opens the store, the artifact directory and the job journal, then
    /// starts the manager, which reconciles before returning.
    pub async fn initialize(config: AppConfig) -> Result<Self> {
        let validator = InputValidator::new();
        validator.validate_file_path(&config.download_path.to_string_lossy())?;
        validator.validate_file_path(&config.data_path.to_string_lossy())?;
        ensure_dir_exists(&config.data_path).await?;

        let artifacts = Arc::new(FsArtifactStorage::new(
            config.download_path.clone(),
            config.get_format_extension(),
        )?);
        let store = Arc::new(JsonMediaStore::open(config.store_path()).await?);

        let pool = Arc::new(HttpPool::new(config.request_timeout_secs, config.proxy.as_deref())?);
        let worker = Arc::new(HttpDownloadWorker::new(pool, artifacts.clone()));
        let scheduler = Arc::new(
            LocalJobScheduler::open(worker, config.max_concurrent_downloads, config.journal_path())
                .await?
                .with_finished_retention(config.finished_job_retention),
        );

        let manager = DownloadManager::start(
            scheduler,
            store,
            artifacts.clone(),
            config.status_stream_capacity,
        )
        .await?;
        info!("Download manager initialized successfully");

        Ok(Self {
            config,
            manager,
            artifacts,
        })
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download a media item and follow it until it settles
    Download {
        id: String,
        /// Audio stream to fetch
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        author: String,
        #[arg(long)]
        thumbnail: Option<String>,
        #[arg(long)]
        duration: Option<u64>,
        /// Playlist to file the item under, as ID=NAME
        #[arg(long = "playlist", value_parser = parse_playlist)]
        playlists: Vec<MediaItemPlaylist>,
        /// Return right after enqueueing
        #[arg(long)]
        detach: bool,
    },
    /// Retry a failed download
    Retry {
        id: String,
        #[arg(long)]
        detach: bool,
    },
    /// Cancel a download and delete the item
    Cancel { id: String },
    /// Print the status of one or more items
    Status {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List downloads that have a live job
    Jobs,
    /// Reconcile the store with the job scheduler
    Reconcile,
    /// Print the effective configuration
    Config,
}

pub fn parse_playlist(value: &str) -> std::result::Result<MediaItemPlaylist, String> {
    let (id, name) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=NAME, got '{}'", value))?;
    let id = id
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid playlist id '{}': {}", id, e))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("playlist name cannot be empty".to_string());
    }
    Ok(MediaItemPlaylist::new(id, name))
}

pub async fn run(state: &AppState, command: Command) -> Result<()> {
    match command {
        Command::Download {
            id,
            url,
            title,
            author,
            thumbnail,
            duration,
            playlists,
            detach,
        } => {
            let item = VideoItem {
                id: MediaItemId::from(id),
                title,
                author,
                duration_secs: duration,
                thumbnail_url: thumbnail,
                source_url: url,
            };
            start_download(state, &item, &playlists, detach).await
        }
        Command::Retry { id, detach } => retry_download(state, &MediaItemId::from(id), detach).await,
        Command::Cancel { id } => {
            let id = MediaItemId::from(id);
            state.manager.cancel(&id).await?;
            print_status(&state.manager.query_status(&id));
            Ok(())
        }
        Command::Status { ids } => {
            for id in ids {
                print_status(&state.manager.query_status(&MediaItemId::from(id)));
            }
            Ok(())
        }
        Command::Jobs => {
            let jobs = state.manager.downloading_jobs().await?;
            if jobs.is_empty() {
                println!("No active downloads");
            }
            for job in jobs {
                println!(
                    "{}  {} - {}  [{}]  {}",
                    job.media_item.id,
                    job.media_item.author,
                    job.media_item.title,
                    job.job_id,
                    describe(&job.status.state)
                );
            }
            Ok(())
        }
        Command::Reconcile => {
            let report = state.manager.reconcile().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&state.config)?);
            println!("Artifacts on disk: {} bytes", state.artifacts.total_size()?);
            Ok(())
        }
    }
}

async fn start_download(
    state: &AppState,
    item: &VideoItem,
    playlists: &[MediaItemPlaylist],
    detach: bool,
) -> Result<()> {
    // Subscribe first; the stream has no replay.
    let updates = state.manager.observe_item(&item.id);
    state.manager.enqueue(item, playlists).await?;
    if detach {
        print_status(&state.manager.query_status(&item.id));
        return Ok(());
    }
    follow_until_settled(state, &item.id, updates).await
}

async fn retry_download(state: &AppState, id: &MediaItemId, detach: bool) -> Result<()> {
    let updates = state.manager.observe_item(id);
    state.manager.retry(id).await?;
    if detach {
        print_status(&state.manager.query_status(id));
        return Ok(());
    }
    follow_until_settled(state, id, updates).await
}

/// Prints transitions until the item settles. Ctrl-C stops following but
/// leaves the job running; it resumes on the next start.
async fn follow_until_settled(
    state: &AppState,
    id: &MediaItemId,
    mut updates: crate::downloader::broadcast::StatusSubscriber,
) -> Result<()> {
    let current = state.manager.query_status(id);
    print_status(&current);
    if current.state.is_settled() {
        return settled(current);
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(status) => {
                    print_status(&status);
                    if status.state.is_settled() {
                        return settled(status);
                    }
                }
                None => return Err(AppError::Download("Status stream closed".to_string())),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Stopped following {}; the download continues on next start", id);
                return Ok(());
            }
        }
    }
}

fn settled(status: Status) -> Result<()> {
    match status.state {
        DownloadState::Failed { error_message } => Err(AppError::Download(
            error_message.unwrap_or_else(|| "download failed".to_string()),
        )),
        _ => Ok(()),
    }
}

fn describe(state: &DownloadState) -> String {
    match state {
        DownloadState::NotRequested => "not requested".to_string(),
        DownloadState::Downloading {
            progress_percent,
            bytes_downloaded,
            bytes_total,
        } => format!("downloading {}% ({}/{} bytes)", progress_percent, bytes_downloaded, bytes_total),
        DownloadState::Downloaded { byte_size } => format!("downloaded ({} bytes)", byte_size),
        DownloadState::Failed { error_message } => format!(
            "failed: {}",
            error_message.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn print_status(status: &Status) {
    println!("{}: {}", status.media_item_id, describe(&status.state));
}
