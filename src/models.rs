use serde::{Deserialize, Serialize};
use std::fmt;

use crate::scheduler::JobId;

/// Stable identifier of a remote media item (the video id on the platform).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaItemId(String);

impl MediaItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MediaItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Metadata of a remote item as fetched from the video platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoItem {
    pub id: MediaItemId,
    pub title: String,
    pub author: String,
    pub duration_secs: Option<u64>,
    pub thumbnail_url: Option<String>,
    /// Resolved audio stream the worker downloads from.
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaItemPlaylist {
    pub id: i64,
    pub name: String,
}

impl MediaItemPlaylist {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

/// Durable row of the media store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItemRecord {
    pub id: MediaItemId,
    pub title: String,
    pub author: String,
    pub duration_secs: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub source_url: String,
    /// Non-null only while a download job is live.
    pub job_id: Option<JobId>,
    pub playlists: Vec<MediaItemPlaylist>,
    /// Set once the artifact has been written by a successful job.
    pub downloaded: bool,
    pub last_error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl MediaItemRecord {
    pub fn new(item: &VideoItem, playlists: &[MediaItemPlaylist], job_id: JobId) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            author: item.author.clone(),
            duration_secs: item.duration_secs,
            thumbnail_url: item.thumbnail_url.clone(),
            source_url: item.source_url.clone(),
            job_id: Some(job_id),
            playlists: playlists.to_vec(),
            downloaded: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Adds playlists the record is not yet part of, keeping existing order.
    pub fn merge_playlists(&mut self, playlists: &[MediaItemPlaylist]) {
        for playlist in playlists {
            if !self.playlists.contains(playlist) {
                self.playlists.push(playlist.clone());
            }
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }

    pub fn to_video_item(&self) -> VideoItem {
        VideoItem {
            id: self.id.clone(),
            title: self.title.clone(),
            author: self.author.clone(),
            duration_secs: self.duration_secs,
            thumbnail_url: self.thumbnail_url.clone(),
            source_url: self.source_url.clone(),
        }
    }
}
