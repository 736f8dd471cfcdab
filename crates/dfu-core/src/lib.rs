//! DFU-Core: firmware upgrade image ingestion in Rust.
//!
//! This crate receives a partitioned upgrade image as a stream of
//! arbitrarily fragmented chunks, validates it section by section, writes
//! each partition to the inactive bank and checks the footer signature
//! before the image may be committed. Progress is checkpointed so an
//! interrupted transfer picks up again without rewriting closed partitions.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Section ids, header layouts, signing modes, image builder
//! - **Storage**: Partition driver abstraction (files, memory)
//! - **Checkpoint**: Persisted progress and mirrored header bytes
//! - **Transport**: Image sources answering data requests
//! - **State**: Parser state and section handlers
//! - **Verify**: Image digest and signature check
//! - **Engine**: One upgrade session over the collaborators above
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator over files on disk
//!
//! # Example
//!
//! ```no_run
//! use dfu_core::session::{DfuSession, SessionConfig};
//!
//! let config = SessionConfig {
//!     image_path: Some("upgrade.bin".to_string()),
//!     ..Default::default()
//! };
//!
//! let mut session = DfuSession::new(config);
//! session.run().expect("DFU failed");
//! ```

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod state;
pub mod storage;
pub mod transport;
pub mod verify;

// Re-exports for convenience
pub use checkpoint::{
    CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    PersistedCheckpoint, ResumePoint,
};
pub use engine::{EngineConfig, Start, UpgradeSession};
pub use error::{DfuError, ErrorClass};
pub use events::{DfuEvent, DfuObserver, DfuPhase, LogLevel, NullObserver, TracingObserver};
pub use protocol::{ImageBuilder, ImageLayout, SigningMode, UpgradeHeader, Version};
pub use session::{DfuSession, SessionConfig, SessionStatus};
pub use state::HandleResult;
pub use storage::{FilePartitions, MemoryPartitions, PartitionDriver, StorageError};
pub use transport::{DataRequest, Delivery, FileSource, ImageSource, SliceSource, TransportError};
pub use verify::{DigestVerifier, ImageVerifier};
