use std::collections::HashMap;
use std::path::PathBuf;

use log::info;
use tokio::sync::{watch, RwLock};

use super::MediaStore;
use crate::errors::Result;
use crate::models::{MediaItemId, MediaItemRecord};
use crate::utils::{ensure_dir_exists, write_atomically};

/// Media store persisted as a single JSON document. Every mutation rewrites
/// the file before the change becomes visible to watchers.
pub struct JsonMediaStore {
    path: Option<PathBuf>,
    records: RwLock<HashMap<MediaItemId, MediaItemRecord>>,
    changes: watch::Sender<Vec<MediaItemRecord>>,
}

impl JsonMediaStore {
    pub fn in_memory() -> Self {
        Self::with_records(None, HashMap::new())
    }

    pub async fn open(path: PathBuf) -> Result<Self> {
        let records: Vec<MediaItemRecord> = if path.exists() {
            let content = tokio::fs::read(&path).await?;
            serde_json::from_slice(&content)?
        } else {
            if let Some(parent) = path.parent() {
                ensure_dir_exists(parent).await?;
            }
            Vec::new()
        };

        info!("Loaded {} media records from {:?}", records.len(), path);
        let records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Ok(Self::with_records(Some(path), records))
    }

    fn with_records(path: Option<PathBuf>, records: HashMap<MediaItemId, MediaItemRecord>) -> Self {
        let (changes, _) = watch::channel(Self::snapshot(&records));
        Self {
            path,
            records: RwLock::new(records),
            changes,
        }
    }

    fn snapshot(records: &HashMap<MediaItemId, MediaItemRecord>) -> Vec<MediaItemRecord> {
        let mut snapshot: Vec<MediaItemRecord> = records.values().cloned().collect();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshot
    }

    async fn commit(&self, records: &HashMap<MediaItemId, MediaItemRecord>) -> Result<()> {
        let snapshot = Self::snapshot(records);
        if let Some(path) = &self.path {
            let content = serde_json::to_vec_pretty(&snapshot)?;
            write_atomically(path, &content).await?;
        }
        self.changes.send_replace(snapshot);
        Ok(())
    }
}

#[async_trait::async_trait]
impl MediaStore for JsonMediaStore {
    async fn get_record(&self, id: &MediaItemId) -> Result<Option<MediaItemRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn upsert_record(&self, record: MediaItemRecord) -> Result<()> {
        let mut records = self.records.write().await;
        let previous = records.insert(record.id.clone(), record.clone());
        if let Err(e) = self.commit(&records).await {
            // Keep memory in line with what is on disk.
            match previous {
                Some(previous) => records.insert(record.id.clone(), previous),
                None => records.remove(&record.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete_record(&self, id: &MediaItemId) -> Result<()> {
        let mut records = self.records.write().await;
        let Some(previous) = records.remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.commit(&records).await {
            records.insert(id.clone(), previous);
            return Err(e);
        }
        Ok(())
    }

    async fn records_with_active_job(&self) -> Result<Vec<MediaItemRecord>> {
        let records = self.records.read().await;
        Ok(Self::snapshot(&records)
            .into_iter()
            .filter(|record| record.job_id.is_some())
            .collect())
    }

    async fn all_records(&self) -> Result<Vec<MediaItemRecord>> {
        Ok(Self::snapshot(&*self.records.read().await))
    }

    fn watch_records(&self) -> watch::Receiver<Vec<MediaItemRecord>> {
        self.changes.subscribe()
    }
}
