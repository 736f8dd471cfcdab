//! Directory-backed partition driver.
//!
//! Each partition is a file `partition_<n>.bin`. The first four bytes are
//! reserved on open and receive the first word on close, so a half-written
//! partition never carries a valid first word.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::traits::{EraseStatus, PartitionDriver, PartitionHandle, StorageError};
use crate::protocol::FIRST_WORD_SIZE;

struct OpenFile {
    partition: u16,
    first_word: u32,
    file: File,
}

/// Partitions stored as files under one directory.
pub struct FilePartitions {
    dir: PathBuf,
    default_capacity: u32,
    capacities: HashMap<u16, u32>,
    open: Mutex<HashMap<u64, OpenFile>>,
    next_handle: Mutex<u64>,
}

impl FilePartitions {
    pub fn new(dir: impl Into<PathBuf>, default_capacity: u32) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            default_capacity,
            capacities: HashMap::new(),
            open: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
        })
    }

    pub fn with_capacity(mut self, partition: u16, capacity: u32) -> Self {
        self.capacities.insert(partition, capacity);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, partition: u16) -> PathBuf {
        self.dir.join(format!("partition_{}.bin", partition))
    }

    fn open_files(&self) -> MutexGuard<'_, HashMap<u64, OpenFile>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn commit_first_word(file: &mut File, first_word: u32) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&first_word.to_le_bytes())?;
    file.sync_all()
}

impl PartitionDriver for FilePartitions {
    fn physical_capacity(&self, partition: u16) -> Result<u32, StorageError> {
        Ok(*self
            .capacities
            .get(&partition)
            .unwrap_or(&self.default_capacity))
    }

    fn open(&self, partition: u16, first_word: u32) -> Result<PartitionHandle, StorageError> {
        let mut open = self.open_files();
        if open.values().any(|o| o.partition == partition) {
            return Err(StorageError::AlreadyOpen(partition));
        }

        let path = self.path_for(partition);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::OpenFailed {
                partition,
                message: e.to_string(),
            })?;
        let len = file.metadata()?.len();
        if len < FIRST_WORD_SIZE as u64 {
            file.set_len(0)?;
            file.write_all(&[0u8; FIRST_WORD_SIZE])?;
        }
        file.seek(SeekFrom::End(0))?;

        let id = {
            let mut next = self.next_handle.lock().unwrap_or_else(|e| e.into_inner());
            let id = *next;
            *next += 1;
            id
        };
        debug!(partition, path = %path.display(), "Opened partition file");
        open.insert(
            id,
            OpenFile {
                partition,
                first_word,
                file,
            },
        );
        Ok(PartitionHandle::new(partition, id))
    }

    fn write(&self, handle: &PartitionHandle, data: &[u8]) -> usize {
        let mut open = self.open_files();
        let Some(entry) = open.get_mut(&handle.id()) else {
            return 0;
        };
        match entry.file.write_all(data) {
            Ok(()) => data.len(),
            Err(e) => {
                warn!(partition = handle.partition(), error = %e, "Partition write failed");
                0
            }
        }
    }

    fn offset(&self, handle: &PartitionHandle) -> u32 {
        let open = self.open_files();
        open.get(&handle.id())
            .and_then(|entry| entry.file.metadata().ok())
            .map_or(0, |m| m.len().saturating_sub(FIRST_WORD_SIZE as u64) as u32)
    }

    fn close(&self, handle: PartitionHandle) -> Result<(), StorageError> {
        let mut entry = self
            .open_files()
            .remove(&handle.id())
            .ok_or(StorageError::StaleHandle(handle.partition()))?;
        commit_first_word(&mut entry.file, entry.first_word).map_err(|e| {
            StorageError::CloseFailed {
                partition: entry.partition,
                message: e.to_string(),
            }
        })
    }

    fn read(&self, partition: u16) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(partition);
        if !path.exists() {
            return Err(StorageError::NotFound(partition));
        }
        Ok(fs::read(path)?)
    }

    fn begin_erase(&self) -> Result<EraseStatus, StorageError> {
        self.open_files().clear();
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::EraseFailed(e.to_string()))?;
        let mut removed = 0usize;
        for entry in entries {
            let path = entry?.path();
            let is_partition = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("partition_") && n.ends_with(".bin"));
            if is_partition {
                fs::remove_file(&path).map_err(|e| StorageError::EraseFailed(e.to_string()))?;
                removed += 1;
            }
        }
        info!(dir = %self.dir.display(), removed, "Erased partition directory");
        Ok(EraseStatus::Complete)
    }

    fn erase_status(&self) -> Option<bool> {
        Some(true)
    }
}
