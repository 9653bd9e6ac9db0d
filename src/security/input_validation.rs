use crate::errors::{AppError, Result};
use url::Url;
use std::path::Path;

const MAX_MEDIA_ITEM_ID_LEN: usize = 128;

#[derive(Debug, Default)]
pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    /// Media item ids become file names, so they must be safe path segments.
    pub fn validate_media_item_id(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(AppError::Validation("Media item id cannot be empty".to_string()));
        }

        if id.len() > MAX_MEDIA_ITEM_ID_LEN {
            return Err(AppError::Validation(format!(
                "Media item id too long (max {} characters)",
                MAX_MEDIA_ITEM_ID_LEN
            )));
        }

        if id == "." || id == ".." || id.contains('/') || id.contains('\\') {
            return Err(AppError::Validation(format!("Media item id is not a valid path segment: {}", id)));
        }

        if id.chars().any(|c| c.is_control()) {
            return Err(AppError::Validation("Control characters not allowed in media item id".to_string()));
        }

        Ok(())
    }

    pub fn validate_source_url(&self, url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(AppError::Validation("URL cannot be empty".to_string()));
        }

        let parsed_url = Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

        if !matches!(parsed_url.scheme(), "http" | "https") {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                parsed_url.scheme()
            )));
        }

        if parsed_url.host_str().is_none() {
            return Err(AppError::Validation("URL must have a host".to_string()));
        }

        Ok(())
    }

    pub fn validate_file_path(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(AppError::Validation("File path cannot be empty".to_string()));
        }

        let path = Path::new(path);

        // Check for path traversal attempts
        if path.components().any(|component| {
            matches!(component, std::path::Component::ParentDir)
        }) {
            return Err(AppError::Validation("Path traversal detected".to_string()));
        }

        // Check for null bytes
        if path.to_string_lossy().contains('\0') {
            return Err(AppError::Validation("Null bytes not allowed in file path".to_string()));
        }

        Ok(())
    }
}
