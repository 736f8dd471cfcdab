//! In-memory partition driver for testing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{EraseStatus, PartitionDriver, PartitionHandle, StorageError};

/// How `begin_erase` behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    Immediate,
    /// Stays pending until `finish_erase` is called.
    Deferred,
    Fail,
}

#[derive(Debug, Default, Clone)]
struct StoredPartition {
    first_word: Option<u32>,
    data: Vec<u8>,
    closed: bool,
}

#[derive(Debug)]
struct OpenPartition {
    partition: u16,
    first_word: u32,
}

#[derive(Debug)]
struct Inner {
    partitions: HashMap<u16, StoredPartition>,
    open: HashMap<u64, OpenPartition>,
    capacities: HashMap<u16, u32>,
    default_capacity: u32,
    next_handle: u64,
    write_limit: Option<usize>,
    fail_open: bool,
    fail_close: bool,
    erase_mode: EraseMode,
    erase_state: Option<bool>,
    erase_count: usize,
    open_count: usize,
    bytes_written: usize,
}

/// Shared in-memory flash.
///
/// Clones share the same flash, so a clone handed to a second session
/// simulates a reboot with the partitions intact.
#[derive(Debug, Clone)]
pub struct MemoryPartitions {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryPartitions {
    pub fn new() -> Self {
        Self::with_capacity(64 * 1024)
    }

    pub fn with_capacity(default_capacity: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                partitions: HashMap::new(),
                open: HashMap::new(),
                capacities: HashMap::new(),
                default_capacity,
                next_handle: 1,
                write_limit: None,
                fail_open: false,
                fail_close: false,
                erase_mode: EraseMode::Immediate,
                erase_state: Some(true),
                erase_count: 0,
                open_count: 0,
                bytes_written: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_capacity(&self, partition: u16, capacity: u32) {
        self.lock().capacities.insert(partition, capacity);
    }

    /// Accept at most `limit` bytes per write call.
    pub fn limit_writes(&self, limit: Option<usize>) {
        self.lock().write_limit = limit;
    }

    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.lock().fail_close = fail;
    }

    pub fn set_erase_mode(&self, mode: EraseMode) {
        self.lock().erase_mode = mode;
    }

    /// Complete a deferred erase.
    pub fn finish_erase(&self, ok: bool) {
        let mut inner = self.lock();
        if ok {
            inner.partitions.clear();
        }
        inner.erase_state = Some(ok);
    }

    /// Content of a partition, first word included once closed.
    pub fn content(&self, partition: u16) -> Option<Vec<u8>> {
        let inner = self.lock();
        inner.partitions.get(&partition).map(|p| {
            let mut out = p.first_word.unwrap_or(0).to_le_bytes().to_vec();
            out.extend_from_slice(&p.data);
            out
        })
    }

    /// Bytes written after the first word, whether or not closed.
    pub fn written(&self, partition: u16) -> usize {
        self.lock()
            .partitions
            .get(&partition)
            .map_or(0, |p| p.data.len())
    }

    pub fn is_closed(&self, partition: u16) -> bool {
        self.lock()
            .partitions
            .get(&partition)
            .is_some_and(|p| p.closed)
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open.len()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn erase_count(&self) -> usize {
        self.lock().erase_count
    }

    /// Total payload bytes accepted since creation.
    pub fn bytes_written(&self) -> usize {
        self.lock().bytes_written
    }

    /// Drop open handles without closing, as a power cut would.
    pub fn power_cut(&self) {
        self.lock().open.clear();
    }
}

impl Default for MemoryPartitions {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionDriver for MemoryPartitions {
    fn physical_capacity(&self, partition: u16) -> Result<u32, StorageError> {
        let inner = self.lock();
        Ok(*inner
            .capacities
            .get(&partition)
            .unwrap_or(&inner.default_capacity))
    }

    fn open(&self, partition: u16, first_word: u32) -> Result<PartitionHandle, StorageError> {
        let mut inner = self.lock();
        if inner.fail_open {
            return Err(StorageError::OpenFailed {
                partition,
                message: "injected failure".into(),
            });
        }
        if inner.open.values().any(|o| o.partition == partition) {
            return Err(StorageError::AlreadyOpen(partition));
        }
        let id = inner.next_handle;
        inner.next_handle += 1;
        inner.open_count += 1;
        inner.open.insert(
            id,
            OpenPartition {
                partition,
                first_word,
            },
        );
        let stored = inner.partitions.entry(partition).or_default();
        stored.closed = false;
        Ok(PartitionHandle::new(partition, id))
    }

    fn write(&self, handle: &PartitionHandle, data: &[u8]) -> usize {
        let mut inner = self.lock();
        if !inner.open.contains_key(&handle.id()) {
            return 0;
        }
        let n = inner.write_limit.map_or(data.len(), |l| l.min(data.len()));
        inner
            .partitions
            .entry(handle.partition())
            .or_default()
            .data
            .extend_from_slice(&data[..n]);
        inner.bytes_written += n;
        n
    }

    fn offset(&self, handle: &PartitionHandle) -> u32 {
        self.lock()
            .partitions
            .get(&handle.partition())
            .map_or(0, |p| p.data.len() as u32)
    }

    fn close(&self, handle: PartitionHandle) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let open = inner
            .open
            .remove(&handle.id())
            .ok_or(StorageError::StaleHandle(handle.partition()))?;
        if inner.fail_close {
            return Err(StorageError::CloseFailed {
                partition: open.partition,
                message: "injected failure".into(),
            });
        }
        let stored = inner.partitions.entry(open.partition).or_default();
        stored.first_word = Some(open.first_word);
        stored.closed = true;
        Ok(())
    }

    fn read(&self, partition: u16) -> Result<Vec<u8>, StorageError> {
        self.content(partition)
            .ok_or(StorageError::NotFound(partition))
    }

    fn begin_erase(&self) -> Result<EraseStatus, StorageError> {
        let mut inner = self.lock();
        inner.erase_count += 1;
        inner.open.clear();
        match inner.erase_mode {
            EraseMode::Immediate => {
                inner.partitions.clear();
                inner.erase_state = Some(true);
                Ok(EraseStatus::Complete)
            }
            EraseMode::Deferred => {
                inner.erase_state = None;
                Ok(EraseStatus::Pending)
            }
            EraseMode::Fail => Err(StorageError::EraseFailed("injected failure".into())),
        }
    }

    fn erase_status(&self) -> Option<bool> {
        self.lock().erase_state
    }
}
