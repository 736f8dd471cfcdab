//! TOML file checkpoint store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CheckpointError, CheckpointStore, PersistedCheckpoint};
use crate::protocol::HEADER_SLOT_SIZE;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    slots: Vec<Vec<u8>>,
    #[serde(default)]
    checkpoint: PersistedCheckpoint,
}

/// Checkpoint persisted as a TOML document.
///
/// Every update rewrites the file through a temporary sibling and a rename,
/// so a power cut leaves either the old or the new document.
pub struct FileCheckpointStore {
    path: PathBuf,
    slot_count: usize,
    cache: Mutex<CheckpointFile>,
}

impl FileCheckpointStore {
    /// Open the store at `path`, loading existing contents if present.
    pub fn open(path: impl Into<PathBuf>, slot_count: usize) -> Result<Self, CheckpointError> {
        let path = path.into();
        let mut file = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str::<CheckpointFile>(&content)?
        } else {
            CheckpointFile::default()
        };
        file.slots.resize(slot_count, Vec::new());
        Ok(Self {
            path,
            slot_count,
            cache: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointFile> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush(&self, file: &CheckpointFile) -> Result<(), CheckpointError> {
        let content = toml::to_string_pretty(file)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Checkpoint flushed");
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<PersistedCheckpoint, CheckpointError> {
        Ok(self.lock().checkpoint.clone())
    }

    fn save(&self, checkpoint: &PersistedCheckpoint) -> Result<(), CheckpointError> {
        let mut file = self.lock();
        file.checkpoint = checkpoint.clone();
        self.flush(&file)
    }

    fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn read_slot(&self, index: usize) -> Result<Vec<u8>, CheckpointError> {
        self.lock()
            .slots
            .get(index)
            .cloned()
            .ok_or(CheckpointError::SlotOutOfRange {
                index,
                count: self.slot_count,
            })
    }

    fn write_slot(&self, index: usize, data: &[u8]) -> Result<(), CheckpointError> {
        if data.len() > HEADER_SLOT_SIZE {
            return Err(CheckpointError::SlotTooLarge { len: data.len() });
        }
        let mut file = self.lock();
        let slot = file
            .slots
            .get_mut(index)
            .ok_or(CheckpointError::SlotOutOfRange {
                index,
                count: self.slot_count,
            })?;
        *slot = data.to_vec();
        self.flush(&file)
    }

    fn clear_slots(&self) -> Result<(), CheckpointError> {
        let mut file = self.lock();
        for slot in file.slots.iter_mut() {
            slot.clear();
        }
        self.flush(&file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{PartitionsState, ResumePoint};
    use crate::protocol::Version;

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("checkpoint.toml");

        let store = FileCheckpointStore::open(&path, 4).unwrap();
        let cp = PersistedCheckpoint {
            resume_point: ResumePoint::Transfer,
            partitions_state: PartitionsState::Upgrading,
            last_closed_partition: 6,
            config_version_in_progress: Some(3),
            version_in_progress: Some(Version::new(2, 1)),
        };
        store.save(&cp).unwrap();
        store.write_slot(0, b"APPUHDR5").unwrap();

        let reopened = FileCheckpointStore::open(&path, 4).unwrap();
        assert_eq!(reopened.load().unwrap(), cp);
        assert_eq!(reopened.read_slot(0).unwrap(), b"APPUHDR5");
        assert!(reopened.read_slot(3).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("none.toml"), 2).unwrap();
        assert_eq!(store.load().unwrap(), PersistedCheckpoint::default());
        assert_eq!(store.slot_count(), 2);
    }
}
