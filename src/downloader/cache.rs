use moka::sync::Cache;

use super::CacheEntry;
use crate::models::MediaItemId;

/// In-memory map of the last known status of every tracked media item.
///
/// Entries are only removed when the underlying record goes away, so the
/// cache is built without a capacity or expiry. Each `put` replaces the whole
/// entry; readers never observe a partially updated one.
#[derive(Clone)]
pub struct StatusCache {
    entries: Cache<MediaItemId, CacheEntry>,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().name("download-status").build(),
        }
    }

    pub fn get(&self, id: &MediaItemId) -> Option<CacheEntry> {
        self.entries.get(id)
    }

    pub fn put(&self, id: MediaItemId, entry: CacheEntry) {
        self.entries.insert(id, entry);
    }

    pub fn remove(&self, id: &MediaItemId) {
        self.entries.invalidate(id);
    }

    pub fn all_keys(&self) -> Vec<MediaItemId> {
        self.entries.iter().map(|(id, _)| (*id).clone()).collect()
    }

    /// Sorted copy of every entry.
    pub fn snapshot(&self) -> Vec<(MediaItemId, CacheEntry)> {
        let mut entries: Vec<(MediaItemId, CacheEntry)> = self
            .entries
            .iter()
            .map(|(id, entry)| ((*id).clone(), entry))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{DownloadState, Status};
    use crate::scheduler::JobId;
    use std::sync::Arc;

    fn entry(id: &str, state: DownloadState, job: Option<JobId>) -> CacheEntry {
        CacheEntry::new(Status::new(MediaItemId::from(id), state), job)
    }

    #[test]
    fn put_replaces_whole_entry() {
        let cache = StatusCache::new();
        let id = MediaItemId::from("v1");
        let job = JobId::new();

        cache.put(id.clone(), entry("v1", DownloadState::downloading(10, 100), Some(job)));
        cache.put(id.clone(), entry("v1", DownloadState::Downloaded { byte_size: 100 }, None));

        let stored = cache.get(&id).unwrap();
        assert_eq!(stored.status.state, DownloadState::Downloaded { byte_size: 100 });
        assert_eq!(stored.job_id, None);
    }

    #[test]
    fn remove_and_keys() {
        let cache = StatusCache::new();
        cache.put(MediaItemId::from("a"), entry("a", DownloadState::NotRequested, None));
        cache.put(MediaItemId::from("b"), entry("b", DownloadState::NotRequested, None));
        cache.remove(&MediaItemId::from("a"));

        assert_eq!(cache.all_keys(), vec![MediaItemId::from("b")]);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&MediaItemId::from("a")).is_none());
    }

    #[test]
    fn concurrent_writers_never_tear_entries() {
        let cache = Arc::new(StatusCache::new());
        let id = MediaItemId::from("shared");

        let writers: Vec<_> = (0..8u64)
            .map(|n| {
                let cache = cache.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        let bytes = n * 1000 + i;
                        cache.put(id.clone(), entry("shared", DownloadState::downloading(bytes, bytes), None));
                        if let Some(seen) = cache.get(&id) {
                            // Downloaded and total were written together.
                            if let DownloadState::Downloading { bytes_downloaded, bytes_total, .. } = seen.status.state {
                                assert_eq!(bytes_downloaded, bytes_total);
                            }
                        }
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(cache.len(), 1);
    }
}
