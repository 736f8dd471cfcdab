//! Engine error taxonomy.
//!
//! Every failure the ingestion engine reports maps to a stable host status
//! code (the value sent back to the updater) and to one of four classes.

use std::fmt;

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::storage::StorageError;

/// Broad failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The image itself is structurally wrong.
    Malformed,
    /// The image is well formed but must not be applied to this device.
    Policy,
    /// The partition driver or the checkpoint store failed.
    Storage,
    /// A fixed-size resource (header slots, signature buffer) ran out.
    Resource,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Malformed => write!(f, "malformed"),
            ErrorClass::Policy => write!(f, "policy"),
            ErrorClass::Storage => write!(f, "storage"),
            ErrorClass::Resource => write!(f, "resource"),
        }
    }
}

/// Host status codes.
pub mod codes {
    pub const UNKNOWN_ID: u16 = 0x11;
    pub const WRONG_VARIANT: u16 = 0x13;
    pub const WRONG_PARTITION_NUMBER: u16 = 0x14;
    pub const PARTITION_SIZE_MISMATCH: u16 = 0x15;
    pub const PARTITION_OPEN_FAILED: u16 = 0x17;
    pub const NO_MEMORY: u16 = 0x24;
    pub const SQIF_ERASE: u16 = 0x25;
    pub const BAD_LENGTH_TOO_SHORT: u16 = 0x31;
    pub const BAD_LENGTH_UPGRADE_HEADER: u16 = 0x32;
    pub const BAD_LENGTH_PARTITION_HEADER: u16 = 0x33;
    pub const BAD_LENGTH_SIGNATURE: u16 = 0x34;
    pub const BAD_LENGTH_DATAHDR_RESUME: u16 = 0x35;
    pub const OEM_VALIDATION_FAILED_FOOTER: u16 = 0x3D;
    pub const OEM_VALIDATION_FAILED_MEMORY: u16 = 0x3E;
    pub const PARTITION_CLOSE_FAILED: u16 = 0x40;
    pub const PARTITION_TYPE_NOT_MATCHING: u16 = 0x48;
    pub const PARTITION_WRITE_FAILED_DATA: u16 = 0x51;
    pub const FILE_TOO_SMALL: u16 = 0x58;
    pub const FILE_TOO_BIG: u16 = 0x59;
    pub const INTERNAL_ERROR_1: u16 = 0x65;
    pub const INTERNAL_ERROR_OFFSET: u16 = 0x67;
    pub const INTERNAL_ERROR_STATE: u16 = 0x68;
    pub const WARN_APP_CONFIG_VERSION_INCOMPATIBLE: u16 = 0x80;
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error("Section prefix too short: got {actual} bytes")]
    TooShort { actual: usize },

    #[error("Unknown section id {id:?}")]
    UnknownId { id: [u8; 8] },

    #[error("Bad upgrade header length: {length}")]
    BadLengthUpgradeHeader { length: usize },

    #[error("Partition or footer section before any upgrade header")]
    MissingUpgradeHeader,

    #[error("Bad partition header length: {length}")]
    BadLengthPartitionHeader { length: usize },

    #[error("Bad signature length: expected {expected}, got {actual}")]
    BadLengthSignature { expected: usize, actual: usize },

    #[error("Unknown signing mode 0x{0:02X}")]
    UnknownSigningMode(u8),

    #[error("Delivery of {actual} bytes overruns the {expected} bytes requested")]
    Overrun { expected: usize, actual: usize },

    #[error("Wrong variant: image is for {image:?}, device is {device:?}")]
    WrongVariant { image: String, device: String },

    #[error("No compatible version for running {major}.{minor}")]
    IncompatibleVersion { major: u16, minor: u16 },

    #[error("No compatible PS config for running config version {running}")]
    IncompatiblePsConfig { running: u16 },

    #[error("Partition number {0} is not upgradable")]
    WrongPartitionNumber(u16),

    #[error("Partition {partition} does not live on SQIF {sqif}")]
    PartitionTypeNotMatching { partition: u16, sqif: u16 },

    #[error("Partition {partition} needs {required} bytes, capacity is {capacity}")]
    PartitionSizeMismatch {
        partition: u16,
        required: u32,
        capacity: u32,
    },

    #[error("Failed to open partition {partition}: {source}")]
    PartitionOpenFailed {
        partition: u16,
        #[source]
        source: StorageError,
    },

    #[error("Short write to partition {partition}: {written} of {requested} bytes")]
    PartitionWriteFailed {
        partition: u16,
        requested: usize,
        written: usize,
    },

    #[error("Failed to close partition {partition}: {source}")]
    PartitionCloseFailed {
        partition: u16,
        #[source]
        source: StorageError,
    },

    #[error("Partition {partition} offset {offset} is past its length {length}")]
    OffsetPastPartition {
        partition: u16,
        offset: u32,
        length: u32,
    },

    #[error("Erase of the inactive bank failed")]
    EraseFailed,

    #[error("Data delivered while the bank erase is pending")]
    ErasePending,

    #[error("Image ended before the footer was complete")]
    FileTooSmall,

    #[error("Image continues past the verified footer")]
    FileTooBig,

    #[error("Header slots exhausted")]
    NoMemory,

    #[error("Failed to allocate {size} byte signature buffer")]
    SignatureAllocation { size: usize },

    #[error("Signature verification failed: {0}")]
    VerificationFailed(String),

    #[error("Session is in a terminal state")]
    InvalidState,

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl DfuError {
    /// Host status code for this error.
    pub fn code(&self) -> u16 {
        use codes::*;
        match self {
            DfuError::TooShort { .. } => BAD_LENGTH_TOO_SHORT,
            DfuError::UnknownId { .. } => UNKNOWN_ID,
            DfuError::BadLengthUpgradeHeader { .. }
            | DfuError::MissingUpgradeHeader
            | DfuError::UnknownSigningMode(_) => BAD_LENGTH_UPGRADE_HEADER,
            DfuError::BadLengthPartitionHeader { .. } => BAD_LENGTH_PARTITION_HEADER,
            DfuError::BadLengthSignature { .. } => BAD_LENGTH_SIGNATURE,
            DfuError::Overrun { .. } => BAD_LENGTH_DATAHDR_RESUME,
            DfuError::WrongVariant { .. } => WRONG_VARIANT,
            DfuError::IncompatibleVersion { .. } | DfuError::IncompatiblePsConfig { .. } => {
                WARN_APP_CONFIG_VERSION_INCOMPATIBLE
            }
            DfuError::WrongPartitionNumber(_) => WRONG_PARTITION_NUMBER,
            DfuError::PartitionTypeNotMatching { .. } => PARTITION_TYPE_NOT_MATCHING,
            DfuError::PartitionSizeMismatch { .. } => PARTITION_SIZE_MISMATCH,
            DfuError::PartitionOpenFailed { .. } => PARTITION_OPEN_FAILED,
            DfuError::PartitionWriteFailed { .. } => PARTITION_WRITE_FAILED_DATA,
            DfuError::PartitionCloseFailed { .. } => PARTITION_CLOSE_FAILED,
            DfuError::OffsetPastPartition { .. } => INTERNAL_ERROR_OFFSET,
            DfuError::EraseFailed => SQIF_ERASE,
            DfuError::ErasePending | DfuError::InvalidState => INTERNAL_ERROR_STATE,
            DfuError::FileTooSmall => FILE_TOO_SMALL,
            DfuError::FileTooBig => FILE_TOO_BIG,
            DfuError::NoMemory => NO_MEMORY,
            DfuError::SignatureAllocation { .. } => OEM_VALIDATION_FAILED_MEMORY,
            DfuError::VerificationFailed(_) => OEM_VALIDATION_FAILED_FOOTER,
            DfuError::Checkpoint(_) | DfuError::Storage(_) => INTERNAL_ERROR_1,
        }
    }

    /// Failure class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            DfuError::TooShort { .. }
            | DfuError::UnknownId { .. }
            | DfuError::BadLengthUpgradeHeader { .. }
            | DfuError::MissingUpgradeHeader
            | DfuError::BadLengthPartitionHeader { .. }
            | DfuError::BadLengthSignature { .. }
            | DfuError::UnknownSigningMode(_)
            | DfuError::Overrun { .. }
            | DfuError::WrongPartitionNumber(_)
            | DfuError::PartitionTypeNotMatching { .. }
            | DfuError::FileTooSmall
            | DfuError::FileTooBig
            | DfuError::VerificationFailed(_) => ErrorClass::Malformed,
            DfuError::WrongVariant { .. }
            | DfuError::IncompatibleVersion { .. }
            | DfuError::IncompatiblePsConfig { .. } => ErrorClass::Policy,
            DfuError::PartitionSizeMismatch { .. }
            | DfuError::PartitionOpenFailed { .. }
            | DfuError::PartitionWriteFailed { .. }
            | DfuError::PartitionCloseFailed { .. }
            | DfuError::OffsetPastPartition { .. }
            | DfuError::EraseFailed
            | DfuError::ErasePending
            | DfuError::InvalidState
            | DfuError::Checkpoint(_)
            | DfuError::Storage(_) => ErrorClass::Storage,
            DfuError::NoMemory | DfuError::SignatureAllocation { .. } => ErrorClass::Resource,
        }
    }

    /// Version rejections are reported to the host as warnings.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            DfuError::IncompatibleVersion { .. } | DfuError::IncompatiblePsConfig { .. }
        )
    }
}
