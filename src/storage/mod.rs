pub mod artifacts;
pub mod json_store;

use std::path::PathBuf;
use tokio::sync::watch;

use crate::errors::Result;
use crate::models::{MediaItemId, MediaItemRecord};

pub use artifacts::FsArtifactStorage;
pub use json_store::JsonMediaStore;

/// Durable store of media item records. Each call is atomic on its own;
/// there are no cross-call transactions.
#[async_trait::async_trait]
pub trait MediaStore: Send + Sync {
    async fn get_record(&self, id: &MediaItemId) -> Result<Option<MediaItemRecord>>;
    async fn upsert_record(&self, record: MediaItemRecord) -> Result<()>;
    async fn delete_record(&self, id: &MediaItemId) -> Result<()>;
    async fn records_with_active_job(&self) -> Result<Vec<MediaItemRecord>>;
    async fn all_records(&self) -> Result<Vec<MediaItemRecord>>;
    /// Live view of every record, updated after each committed change.
    fn watch_records(&self) -> watch::Receiver<Vec<MediaItemRecord>>;
}

/// Local files produced by finished downloads. Checks are synchronous so
/// status queries never suspend.
pub trait ArtifactStorage: Send + Sync {
    fn exists(&self, id: &MediaItemId) -> bool;
    fn size_of(&self, id: &MediaItemId) -> Option<u64>;
    fn path_for(&self, id: &MediaItemId) -> PathBuf;
    fn delete(&self, id: &MediaItemId) -> Result<()>;
}
