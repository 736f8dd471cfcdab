//! Raw header bytes mirrored into fixed-size checkpoint slots.

use tracing::{debug, error};

use super::CheckpointStore;
use crate::error::DfuError;
use crate::protocol::HEADER_SLOT_SIZE;

/// Write cursor over the header slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderMirror {
    slot: usize,
    offset: usize,
}

impl HeaderMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor positioned `cursor` bytes into the slot sequence.
    pub fn at(cursor: usize) -> Self {
        Self {
            slot: cursor / HEADER_SLOT_SIZE,
            offset: cursor % HEADER_SLOT_SIZE,
        }
    }

    /// Bytes before the cursor.
    pub fn cursor(&self) -> usize {
        self.slot * HEADER_SLOT_SIZE + self.offset
    }

    pub fn restart(&mut self) {
        *self = Self::default();
    }

    /// Append header bytes at the cursor.
    ///
    /// Bytes already present at the cursor position are left untouched, so a
    /// resumed transfer that re-delivers a stored header costs no slot writes.
    pub fn append<S: CheckpointStore + ?Sized>(
        &mut self,
        store: &S,
        mut data: &[u8],
    ) -> Result<(), DfuError> {
        while !data.is_empty() {
            if self.slot >= store.slot_count() {
                error!(slots = store.slot_count(), "No header slots left");
                return Err(DfuError::NoMemory);
            }

            let n = (HEADER_SLOT_SIZE - self.offset).min(data.len());
            let existing = store.read_slot(self.slot)?;
            if self.offset + n > existing.len() {
                let mut slot = existing;
                slot.resize(self.offset, 0);
                slot.extend_from_slice(&data[..n]);
                debug!(slot = self.slot, offset = self.offset, len = n, "Mirroring header bytes");
                store.write_slot(self.slot, &slot)?;
            }

            self.offset += n;
            data = &data[n..];
            if self.offset == HEADER_SLOT_SIZE {
                self.slot += 1;
                self.offset = 0;
            }
        }
        Ok(())
    }
}

/// Concatenated contents of all used slots.
pub fn read_mirror<S: CheckpointStore + ?Sized>(store: &S) -> Result<Vec<u8>, DfuError> {
    let mut out = Vec::new();
    for index in 0..store.slot_count() {
        let slot = store.read_slot(index)?;
        let full = slot.len() == HEADER_SLOT_SIZE;
        out.extend_from_slice(&slot);
        if !full {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;

    #[test]
    fn test_append_spans_slots() {
        let store = MemoryCheckpointStore::with_slots(4);
        let mut mirror = HeaderMirror::new();
        let data: Vec<u8> = (0..100u8).collect();
        mirror.append(&store, &data).unwrap();

        assert_eq!(store.read_slot(0).unwrap().len(), 64);
        assert_eq!(store.read_slot(1).unwrap().len(), 36);
        assert_eq!(mirror.cursor(), 100);
        assert_eq!(read_mirror(&store).unwrap(), data);
    }

    #[test]
    fn test_existing_bytes_not_rewritten() {
        let store = MemoryCheckpointStore::with_slots(4);
        let mut mirror = HeaderMirror::new();
        mirror.append(&store, &[1u8; 40]).unwrap();
        let writes = store.slot_writes();

        let mut replay = HeaderMirror::new();
        replay.append(&store, &[1u8; 40]).unwrap();
        assert_eq!(store.slot_writes(), writes);

        replay.append(&store, &[2u8; 8]).unwrap();
        assert_eq!(store.slot_writes(), writes + 1);
        assert_eq!(read_mirror(&store).unwrap().len(), 48);
    }

    #[test]
    fn test_exhausted_slots() {
        let store = MemoryCheckpointStore::with_slots(1);
        let mut mirror = HeaderMirror::new();
        mirror.append(&store, &[0u8; 64]).unwrap();
        assert!(matches!(
            mirror.append(&store, &[0u8; 1]),
            Err(DfuError::NoMemory)
        ));
    }

    #[test]
    fn test_cursor_roundtrip() {
        let mirror = HeaderMirror::at(130);
        assert_eq!(mirror.cursor(), 130);
    }
}
