//! In-memory checkpoint store for testing.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{CheckpointError, CheckpointStore, PersistedCheckpoint};
use crate::protocol::{DEFAULT_HEADER_SLOTS, HEADER_SLOT_SIZE};

#[derive(Debug, Default)]
struct Inner {
    checkpoint: PersistedCheckpoint,
    slots: Vec<Vec<u8>>,
    saves: usize,
    slot_writes: usize,
    fail_saves: bool,
}

/// Checkpoint store kept in memory.
///
/// Clones share storage, which lets a test hand the "persisted" state to a
/// second engine as if the device had rebooted.
#[derive(Debug, Clone)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::with_slots(DEFAULT_HEADER_SLOTS)
    }

    pub fn with_slots(count: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots: vec![Vec::new(); count],
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Last saved checkpoint.
    pub fn snapshot(&self) -> PersistedCheckpoint {
        self.lock().checkpoint.clone()
    }

    pub fn save_count(&self) -> usize {
        self.lock().saves
    }

    pub fn slot_writes(&self) -> usize {
        self.lock().slot_writes
    }

    pub fn fail_saves(&self, fail: bool) {
        self.lock().fail_saves = fail;
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<PersistedCheckpoint, CheckpointError> {
        Ok(self.lock().checkpoint.clone())
    }

    fn save(&self, checkpoint: &PersistedCheckpoint) -> Result<(), CheckpointError> {
        let mut inner = self.lock();
        if inner.fail_saves {
            return Err(CheckpointError::Unavailable("injected failure".into()));
        }
        inner.checkpoint = checkpoint.clone();
        inner.saves += 1;
        Ok(())
    }

    fn slot_count(&self) -> usize {
        self.lock().slots.len()
    }

    fn read_slot(&self, index: usize) -> Result<Vec<u8>, CheckpointError> {
        let inner = self.lock();
        inner
            .slots
            .get(index)
            .cloned()
            .ok_or(CheckpointError::SlotOutOfRange {
                index,
                count: inner.slots.len(),
            })
    }

    fn write_slot(&self, index: usize, data: &[u8]) -> Result<(), CheckpointError> {
        if data.len() > HEADER_SLOT_SIZE {
            return Err(CheckpointError::SlotTooLarge { len: data.len() });
        }
        let mut inner = self.lock();
        let count = inner.slots.len();
        let slot = inner
            .slots
            .get_mut(index)
            .ok_or(CheckpointError::SlotOutOfRange { index, count })?;
        *slot = data.to_vec();
        inner.slot_writes += 1;
        Ok(())
    }

    fn clear_slots(&self) -> Result<(), CheckpointError> {
        let mut inner = self.lock();
        for slot in inner.slots.iter_mut() {
            slot.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ResumePoint;

    #[test]
    fn test_clones_share_state() {
        let store = MemoryCheckpointStore::new();
        let rebooted = store.clone();
        let cp = PersistedCheckpoint {
            resume_point: ResumePoint::Transfer,
            last_closed_partition: 3,
            ..Default::default()
        };
        store.save(&cp).unwrap();
        assert_eq!(rebooted.load().unwrap(), cp);
    }

    #[test]
    fn test_slot_bounds() {
        let store = MemoryCheckpointStore::with_slots(2);
        assert!(store.write_slot(2, b"x").is_err());
        assert!(store.write_slot(0, &[0u8; 65]).is_err());
        store.write_slot(1, b"abc").unwrap();
        assert_eq!(store.read_slot(1).unwrap(), b"abc");

        store.clear().unwrap();
        assert!(store.read_slot(1).unwrap().is_empty());
        assert_eq!(store.snapshot(), PersistedCheckpoint::default());
    }
}
