//! DFU image container constants.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DfuError;

// ============================================================================
// Section identifiers
// ============================================================================

/// Length of every section identifier.
pub const ID_FIELD_SIZE: usize = 8;

/// Main upgrade header.
pub const ID_UPGRADE_HEADER: &[u8; ID_FIELD_SIZE] = b"APPUHDR5";
/// Partition data section.
pub const ID_PARTITION_DATA: &[u8; ID_FIELD_SIZE] = b"PARTDATA";
/// Footer carrying the image signature.
pub const ID_FOOTER: &[u8; ID_FIELD_SIZE] = b"APPUPFTR";

// ============================================================================
// Sizes
// ============================================================================

/// Common section prefix: identifier plus big-endian u32 length.
pub const SECTION_PREFIX_SIZE: usize = ID_FIELD_SIZE + 4;

/// Variant tag, new version (major, minor) and compatible version count.
pub const UPGRADE_HEADER_FIXED_SIZE: usize = ID_FIELD_SIZE + 6;

/// Smallest legal upgrade header: no compatible entries at all.
pub const UPGRADE_HEADER_MIN_SIZE: usize = UPGRADE_HEADER_FIXED_SIZE + 4 + 1;

/// SQIF index and partition number.
pub const PARTITION_SECOND_HEADER_SIZE: usize = 4;

/// First word of the partition, written last on close.
pub const FIRST_WORD_SIZE: usize = 4;

/// Partition sub-header as requested by the dispatcher.
pub const PARTITION_HEADER_SIZE: usize = PARTITION_SECOND_HEADER_SIZE + FIRST_WORD_SIZE;

/// Minor version matching every minor of the same major.
pub const WILDCARD_MINOR: u16 = 0xFFFF;

/// Size of one persisted header slot.
pub const HEADER_SLOT_SIZE: usize = 64;

/// Default number of header slots.
pub const DEFAULT_HEADER_SLOTS: usize = 16;

// ============================================================================
// Signing
// ============================================================================

/// Signature scheme announced by the last byte of the upgrade header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SigningMode {
    #[default]
    Rsa1024,
    Rsa2048,
}

impl SigningMode {
    /// Byte in the image that selects this mode.
    pub fn to_byte(self) -> u8 {
        match self {
            SigningMode::Rsa1024 => 0,
            SigningMode::Rsa2048 => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, DfuError> {
        match byte {
            0 => Ok(SigningMode::Rsa1024),
            1 => Ok(SigningMode::Rsa2048),
            other => Err(DfuError::UnknownSigningMode(other)),
        }
    }

    /// Length of the footer signature for this mode.
    pub fn signature_size(self) -> usize {
        match self {
            SigningMode::Rsa1024 => 128,
            SigningMode::Rsa2048 => 256,
        }
    }
}

impl fmt::Display for SigningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningMode::Rsa1024 => write!(f, "RSA-1024"),
            SigningMode::Rsa2048 => write!(f, "RSA-2048"),
        }
    }
}

// ============================================================================
// Partitions
// ============================================================================

/// Image sections that map onto flash partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PartitionKind {
    Nonce = 0,
    AppsP0Header = 1,
    AppsP1Header = 2,
    AudioHeader = 3,
    CuratorFilesystem = 4,
    AppsP0Image = 5,
    AppsRoConfigFilesystem = 6,
    /// User data; never overwritten by an upgrade.
    AppsRwFilesystem = 7,
    AppsRoFilesystem = 8,
    AppsP1Image = 9,
    AppsDeviceRoFilesystem = 10,
    AudioImage = 11,
    AppsRwConfig = 12,
}

impl PartitionKind {
    pub fn from_number(number: u16) -> Option<Self> {
        Some(match number {
            0 => PartitionKind::Nonce,
            1 => PartitionKind::AppsP0Header,
            2 => PartitionKind::AppsP1Header,
            3 => PartitionKind::AudioHeader,
            4 => PartitionKind::CuratorFilesystem,
            5 => PartitionKind::AppsP0Image,
            6 => PartitionKind::AppsRoConfigFilesystem,
            7 => PartitionKind::AppsRwFilesystem,
            8 => PartitionKind::AppsRoFilesystem,
            9 => PartitionKind::AppsP1Image,
            10 => PartitionKind::AppsDeviceRoFilesystem,
            11 => PartitionKind::AudioImage,
            12 => PartitionKind::AppsRwConfig,
            _ => return None,
        })
    }

    /// Look up an upgradable partition. User data is never upgradable.
    pub fn upgradable(number: u16) -> Option<Self> {
        Self::from_number(number).filter(|kind| *kind != PartitionKind::AppsRwFilesystem)
    }

    pub fn number(self) -> u16 {
        self as u16
    }

    /// Flash bank the partition must be written to.
    pub fn expected_sqif(self) -> u16 {
        0
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionKind::Nonce => "NONCE",
            PartitionKind::AppsP0Header => "APPS_P0_HEADER",
            PartitionKind::AppsP1Header => "APPS_P1_HEADER",
            PartitionKind::AudioHeader => "AUDIO_HEADER",
            PartitionKind::CuratorFilesystem => "CURATOR_FILESYSTEM",
            PartitionKind::AppsP0Image => "APPS_P0_IMAGE",
            PartitionKind::AppsRoConfigFilesystem => "APPS_RO_CONFIG_FILESYSTEM",
            PartitionKind::AppsRwFilesystem => "APPS_RW_FILESYSTEM",
            PartitionKind::AppsRoFilesystem => "APPS_RO_FILESYSTEM",
            PartitionKind::AppsP1Image => "APPS_P1_IMAGE",
            PartitionKind::AppsDeviceRoFilesystem => "APPS_DEVICE_RO_FILESYSTEM",
            PartitionKind::AudioImage => "AUDIO_IMAGE",
            PartitionKind::AppsRwConfig => "APPS_RW_CONFIG",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_data_partition_is_not_upgradable() {
        assert_eq!(
            PartitionKind::from_number(7),
            Some(PartitionKind::AppsRwFilesystem)
        );
        assert_eq!(PartitionKind::upgradable(7), None);
        assert_eq!(PartitionKind::upgradable(13), None);
        assert_eq!(
            PartitionKind::upgradable(5),
            Some(PartitionKind::AppsP0Image)
        );
    }

    #[test]
    fn test_signing_mode_bytes() {
        assert_eq!(SigningMode::from_byte(0).unwrap().signature_size(), 128);
        assert_eq!(SigningMode::from_byte(1).unwrap().signature_size(), 256);
        assert!(SigningMode::from_byte(2).is_err());
        assert_eq!(SigningMode::Rsa2048.to_byte(), 1);
    }

    #[test]
    fn test_minimum_header_size() {
        assert_eq!(SECTION_PREFIX_SIZE, 12);
        assert_eq!(UPGRADE_HEADER_MIN_SIZE, 19);
        assert_eq!(PARTITION_HEADER_SIZE, 8);
    }
}
