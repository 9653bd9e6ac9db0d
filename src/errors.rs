use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Nothing to retry for media item {0}")]
    InvalidRetryState(String),

    #[error("Scheduling failure: {0}")]
    SchedulingFailure(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Errors the caller caused and should not retry as-is.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, AppError::InvalidRetryState(_) | AppError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
