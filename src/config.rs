use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use dirs;
use crate::errors::{AppError, Result};

const APP_DIR: &str = "offline-music-downloader";
const ENV_PREFIX: &str = "MUSIC_DL";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    /// Directory holding downloaded audio artifacts.
    pub download_path: PathBuf,
    /// Directory holding the media store and the scheduler journal.
    pub data_path: PathBuf,
    pub max_concurrent_downloads: usize,
    /// Per-subscriber buffer of the status stream. A subscriber that falls
    /// further behind than this loses the oldest transitions.
    pub status_stream_capacity: usize,
    /// Finished jobs the scheduler remembers until they are acknowledged.
    pub finished_job_retention: usize,
    pub preferred_format: AudioFormat,
    pub proxy: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum AudioFormat {
    Mp3,
    M4a,
    Webm,
    Opus,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("./data"))
            .join(APP_DIR);

        Self {
            download_path: dirs::audio_dir()
                .map(|dir| dir.join(APP_DIR))
                .unwrap_or_else(|| data_root.join("tracks")),
            data_path: data_root,
            max_concurrent_downloads: 3,
            status_stream_capacity: 256,
            finished_job_retention: 256,
            preferred_format: AudioFormat::M4a,
            proxy: None,
            request_timeout_secs: 300,
        }
    }
}

impl AppConfig {
    /// Layers defaults, the JSON config file and `MUSIC_DL_*` environment
    /// variables, in that order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::get_config_path()?,
        };

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(
                config::File::from(config_path.as_path())
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::get_config_path()?,
        };

        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(AppError::Validation("max_concurrent_downloads must be at least 1".to_string()));
        }
        if self.status_stream_capacity == 0 {
            return Err(AppError::Validation("status_stream_capacity must be at least 1".to_string()));
        }
        if self.finished_job_retention == 0 {
            return Err(AppError::Validation("finished_job_retention must be at least 1".to_string()));
        }
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config(config::ConfigError::Message("Could not find config directory".to_string())))?;

        Ok(config_dir.join(APP_DIR).join("config.json"))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_path.join("media_items.json")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_path.join("jobs.json")
    }

    pub fn get_format_extension(&self) -> &'static str {
        self.preferred_format.extension()
    }
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Webm => "webm",
            AudioFormat::Opus => "opus",
        }
    }
}
