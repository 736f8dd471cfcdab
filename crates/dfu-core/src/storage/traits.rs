//! Partition driver abstraction.
//!
//! Defines the `PartitionDriver` trait for raw flash partitions,
//! allowing different implementations (files, memory, real flash).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Partition {0} not found")]
    NotFound(u16),

    #[error("Partition {0} is already open")]
    AlreadyOpen(u16),

    #[error("Stale handle for partition {0}")]
    StaleHandle(u16),

    #[error("Open failed for partition {partition}: {message}")]
    OpenFailed { partition: u16, message: String },

    #[error("Close failed for partition {partition}: {message}")]
    CloseFailed { partition: u16, message: String },

    #[error("Erase failed: {0}")]
    EraseFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive write handle to an open partition.
///
/// Not `Clone`: closing consumes the handle, so a partition can only be
/// closed once.
#[derive(Debug, PartialEq, Eq)]
pub struct PartitionHandle {
    partition: u16,
    id: u64,
}

impl PartitionHandle {
    /// Drivers mint handles; `id` distinguishes reopenings of one partition.
    pub fn new(partition: u16, id: u64) -> Self {
        Self { partition, id }
    }

    pub fn partition(&self) -> u16 {
        self.partition
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Result of starting a bulk erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseStatus {
    /// Erase finished synchronously.
    Complete,
    /// Erase runs in the background; poll `erase_status`.
    Pending,
}

/// Raw partition storage on the inactive bank.
pub trait PartitionDriver: Send + Sync {
    /// Physical capacity of a partition in bytes.
    fn physical_capacity(&self, partition: u16) -> Result<u32, StorageError>;

    /// Open a partition for appending. Content written before a restart is kept
    /// and reflected by `offset`. The first word is committed on close.
    fn open(&self, partition: u16, first_word: u32) -> Result<PartitionHandle, StorageError>;

    /// Append bytes. Returns the number of bytes actually written.
    fn write(&self, handle: &PartitionHandle, data: &[u8]) -> usize;

    /// Bytes written after the first word.
    fn offset(&self, handle: &PartitionHandle) -> u32;

    /// Commit the first word and close.
    fn close(&self, handle: PartitionHandle) -> Result<(), StorageError>;

    /// Read back a partition, first word included.
    fn read(&self, partition: u16) -> Result<Vec<u8>, StorageError>;

    /// Start erasing the inactive bank.
    fn begin_erase(&self) -> Result<EraseStatus, StorageError>;

    /// `None` while an erase is running, otherwise whether the last erase succeeded.
    fn erase_status(&self) -> Option<bool>;
}
