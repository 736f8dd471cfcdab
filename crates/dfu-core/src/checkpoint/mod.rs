//! Durable upgrade progress.
//!
//! The checkpoint records how far an upgrade got so that a restarted
//! device can pick the transfer up again. It is written at header and
//! partition boundaries only, never per payload byte.

pub mod file;
pub mod mirror;
pub mod mock;
pub mod replay;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Version;

pub use file::FileCheckpointStore;
pub use mirror::HeaderMirror;
pub use mock::MemoryCheckpointStore;
pub use replay::{ReplayPosition, replay_headers};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Header slot {index} out of range ({count} slots)")]
    SlotOutOfRange { index: usize, count: usize },

    #[error("Header slot data of {len} bytes exceeds slot size")]
    SlotTooLarge { len: usize },

    #[error("Failed to parse checkpoint: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where an interrupted upgrade stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumePoint {
    /// No upgrade in progress.
    #[default]
    Idle,
    /// Image data is being transferred.
    Transfer,
    /// Whole image received and its signature verified.
    Verified,
    /// Verification failed; the image must never be committed.
    Error,
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumePoint::Idle => write!(f, "IDLE"),
            ResumePoint::Transfer => write!(f, "TRANSFER"),
            ResumePoint::Verified => write!(f, "VERIFIED"),
            ResumePoint::Error => write!(f, "ERROR"),
        }
    }
}

/// State of the inactive bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionsState {
    #[default]
    Idle,
    Erased,
    Upgrading,
}

impl fmt::Display for PartitionsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionsState::Idle => write!(f, "IDLE"),
            PartitionsState::Erased => write!(f, "ERASED"),
            PartitionsState::Upgrading => write!(f, "UPGRADING"),
        }
    }
}

/// Persisted session progress.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedCheckpoint {
    pub resume_point: ResumePoint,
    pub partitions_state: PartitionsState,
    /// One past the highest partition closed cleanly; 0 means none.
    pub last_closed_partition: u16,
    pub config_version_in_progress: Option<u16>,
    pub version_in_progress: Option<Version>,
}

impl PersistedCheckpoint {
    /// Record a clean close. Never moves backwards.
    pub fn record_closed(&mut self, partition: u16) {
        self.last_closed_partition = self.last_closed_partition.max(partition.saturating_add(1));
    }

    /// Whether partition `partition` was already written and closed.
    pub fn is_closed(&self, partition: u16) -> bool {
        self.last_closed_partition > partition
    }

    /// Whether a restart can continue without erasing the bank.
    pub fn can_resume(&self) -> bool {
        self.resume_point == ResumePoint::Transfer
            && self.partitions_state == PartitionsState::Upgrading
            && self.last_closed_partition > 0
    }
}

/// Persistent key-value storage for the checkpoint and header slots.
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<PersistedCheckpoint, CheckpointError>;

    fn save(&self, checkpoint: &PersistedCheckpoint) -> Result<(), CheckpointError>;

    /// Number of fixed-size header slots.
    fn slot_count(&self) -> usize;

    /// Bytes stored in a slot; empty if never written.
    fn read_slot(&self, index: usize) -> Result<Vec<u8>, CheckpointError>;

    /// Replace a slot's contents.
    fn write_slot(&self, index: usize, data: &[u8]) -> Result<(), CheckpointError>;

    fn clear_slots(&self) -> Result<(), CheckpointError>;

    /// Forget the upgrade entirely.
    fn clear(&self) -> Result<(), CheckpointError> {
        self.save(&PersistedCheckpoint::default())?;
        self.clear_slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_closed_is_monotonic() {
        let mut cp = PersistedCheckpoint::default();
        assert!(!cp.is_closed(0));
        cp.record_closed(5);
        assert_eq!(cp.last_closed_partition, 6);
        cp.record_closed(1);
        assert_eq!(cp.last_closed_partition, 6);
        assert!(cp.is_closed(5));
        assert!(!cp.is_closed(6));
    }

    #[test]
    fn test_can_resume() {
        let mut cp = PersistedCheckpoint {
            resume_point: ResumePoint::Transfer,
            partitions_state: PartitionsState::Upgrading,
            ..Default::default()
        };
        assert!(!cp.can_resume());
        cp.record_closed(0);
        assert!(cp.can_resume());
        cp.resume_point = ResumePoint::Verified;
        assert!(!cp.can_resume());
    }
}
