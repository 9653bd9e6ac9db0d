use std::path::PathBuf;

use log::debug;

use super::ArtifactStorage;
use crate::errors::Result;
use crate::models::MediaItemId;
use crate::utils::sanitize_filename;

/// Downloaded tracks stored as `<dir>/<id>.<ext>`.
pub struct FsArtifactStorage {
    dir: PathBuf,
    extension: String,
}

impl FsArtifactStorage {
    pub fn new(dir: PathBuf, extension: &str) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            extension: extension.to_string(),
        })
    }

    /// Where a worker writes bytes before the artifact is complete.
    pub fn partial_path_for(&self, id: &MediaItemId) -> PathBuf {
        self.path_for(id).with_extension(format!("{}.part", self.extension))
    }

    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == self.extension.as_str()) {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}

impl ArtifactStorage for FsArtifactStorage {
    fn exists(&self, id: &MediaItemId) -> bool {
        self.path_for(id).is_file()
    }

    fn size_of(&self, id: &MediaItemId) -> Option<u64> {
        std::fs::metadata(self.path_for(id)).ok().map(|m| m.len())
    }

    fn path_for(&self, id: &MediaItemId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", sanitize_filename(id.as_str()), self.extension))
    }

    fn delete(&self, id: &MediaItemId) -> Result<()> {
        for path in [self.path_for(id), self.partial_path_for(id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_size_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsArtifactStorage::new(dir.path().join("tracks"), "m4a").unwrap();
        let id = MediaItemId::from("v1");

        assert!(!storage.exists(&id));
        assert_eq!(storage.size_of(&id), None);

        std::fs::write(storage.path_for(&id), vec![0u8; 4096]).unwrap();
        assert!(storage.exists(&id));
        assert_eq!(storage.size_of(&id), Some(4096));
        assert_eq!(storage.total_size().unwrap(), 4096);

        storage.delete(&id).unwrap();
        assert!(!storage.exists(&id));
        storage.delete(&id).unwrap();
    }

    #[test]
    fn partial_files_are_not_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsArtifactStorage::new(dir.path().to_path_buf(), "m4a").unwrap();
        let id = MediaItemId::from("v1");

        std::fs::write(storage.partial_path_for(&id), b"half").unwrap();
        assert!(!storage.exists(&id));
        assert!(storage.partial_path_for(&id).to_string_lossy().ends_with("v1.m4a.part"));
        assert_eq!(storage.total_size().unwrap(), 0);
    }
}
