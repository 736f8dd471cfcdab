//! Partition storage layer.

pub mod file;
pub mod mock;
pub mod traits;

pub use file::FilePartitions;
pub use mock::{EraseMode, MemoryPartitions};
pub use traits::{EraseStatus, PartitionDriver, PartitionHandle, StorageError};
