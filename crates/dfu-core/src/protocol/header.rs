//! Section headers of the DFU image container.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kinds of section the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    UpgradeHeader,
    PartitionData,
    Footer,
}

impl SectionKind {
    pub fn id(self) -> &'static [u8; ID_FIELD_SIZE] {
        match self {
            SectionKind::UpgradeHeader => ID_UPGRADE_HEADER,
            SectionKind::PartitionData => ID_PARTITION_DATA,
            SectionKind::Footer => ID_FOOTER,
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionKind::UpgradeHeader => write!(f, "HEADER"),
            SectionKind::PartitionData => write!(f, "PARTITION"),
            SectionKind::Footer => write!(f, "FOOTER"),
        }
    }
}

/// `{id, length}` prefix shared by every section (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionPrefix {
    pub id: [u8; ID_FIELD_SIZE],
    /// Big-endian length of the section body that follows.
    pub length: u32,
}

impl SectionPrefix {
    pub const SIZE: usize = SECTION_PREFIX_SIZE;

    pub fn new(kind: SectionKind, length: u32) -> Self {
        Self {
            id: *kind.id(),
            length,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut id = [0u8; ID_FIELD_SIZE];
        id.copy_from_slice(&data[..ID_FIELD_SIZE]);
        let mut cursor = Cursor::new(&data[ID_FIELD_SIZE..]);
        Ok(Self {
            id,
            length: cursor.read_u32::<BigEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; SECTION_PREFIX_SIZE] {
        let mut buf = [0u8; SECTION_PREFIX_SIZE];
        buf[..ID_FIELD_SIZE].copy_from_slice(&self.id);
        buf[ID_FIELD_SIZE..].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Known section kind, or `None` for an unknown identifier.
    pub fn kind(&self) -> Option<SectionKind> {
        [
            SectionKind::UpgradeHeader,
            SectionKind::PartitionData,
            SectionKind::Footer,
        ]
        .into_iter()
        .find(|kind| kind.id() == &self.id)
    }
}

/// Application version, `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Whether this compatibility entry admits the `running` version.
    pub fn admits(&self, running: Version) -> bool {
        self.major == running.major && (self.minor == running.minor || self.minor == WILDCARD_MINOR)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == WILDCARD_MINOR {
            write!(f, "{}.*", self.major)
        } else {
            write!(f, "{}.{}", self.major, self.minor)
        }
    }
}

/// Main upgrade header body (after the section prefix).
///
/// Layout, big-endian:
/// `variant[8] major minor n {major minor}*n ps_version m {ps}*m signing_mode`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeHeader {
    pub variant: [u8; ID_FIELD_SIZE],
    pub version: Version,
    pub compatible_versions: Vec<Version>,
    pub ps_config_version: u16,
    pub compatible_ps_configs: Vec<u16>,
    /// Raw signing mode byte, decoded by the header handler.
    pub signing_mode: u8,
}

impl UpgradeHeader {
    /// Exact body length for `n` version and `m` PS-config entries.
    pub const fn body_len(n: usize, m: usize) -> usize {
        UPGRADE_HEADER_FIXED_SIZE + 4 * n + 4 + 2 * m + 1
    }

    /// Parse the header, checking each count against the buffer before it is used.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < UPGRADE_HEADER_FIXED_SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: UPGRADE_HEADER_FIXED_SIZE,
                actual: data.len(),
            });
        }

        let mut variant = [0u8; ID_FIELD_SIZE];
        variant.copy_from_slice(&data[..ID_FIELD_SIZE]);
        let mut cursor = Cursor::new(&data[ID_FIELD_SIZE..]);
        let version = Version::new(
            cursor.read_u16::<BigEndian>()?,
            cursor.read_u16::<BigEndian>()?,
        );
        let n = cursor.read_u16::<BigEndian>()? as usize;

        let before_ps = UPGRADE_HEADER_FIXED_SIZE + 4 * n + 4;
        if data.len() < before_ps {
            return Err(HeaderError::BufferTooSmall {
                expected: before_ps,
                actual: data.len(),
            });
        }
        let mut compatible_versions = Vec::with_capacity(n);
        for _ in 0..n {
            compatible_versions.push(Version::new(
                cursor.read_u16::<BigEndian>()?,
                cursor.read_u16::<BigEndian>()?,
            ));
        }
        let ps_config_version = cursor.read_u16::<BigEndian>()?;
        let m = cursor.read_u16::<BigEndian>()? as usize;

        let expected = Self::body_len(n, m);
        if data.len() != expected {
            return Err(HeaderError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        let mut compatible_ps_configs = Vec::with_capacity(m);
        for _ in 0..m {
            compatible_ps_configs.push(cursor.read_u16::<BigEndian>()?);
        }
        let signing_mode = cursor.read_u8()?;

        Ok(Self {
            variant,
            version,
            compatible_versions,
            ps_config_version,
            compatible_ps_configs,
            signing_mode,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::body_len(
            self.compatible_versions.len(),
            self.compatible_ps_configs.len(),
        ));
        buf.extend_from_slice(&self.variant);
        buf.extend_from_slice(&self.version.major.to_be_bytes());
        buf.extend_from_slice(&self.version.minor.to_be_bytes());
        buf.extend_from_slice(&(self.compatible_versions.len() as u16).to_be_bytes());
        for v in &self.compatible_versions {
            buf.extend_from_slice(&v.major.to_be_bytes());
            buf.extend_from_slice(&v.minor.to_be_bytes());
        }
        buf.extend_from_slice(&self.ps_config_version.to_be_bytes());
        buf.extend_from_slice(&(self.compatible_ps_configs.len() as u16).to_be_bytes());
        for ps in &self.compatible_ps_configs {
            buf.extend_from_slice(&ps.to_be_bytes());
        }
        buf.push(self.signing_mode);
        buf
    }

    /// Variant tag with trailing NUL padding removed.
    pub fn variant_str(&self) -> String {
        variant_to_string(&self.variant)
    }
}

/// Pad a variant name to the fixed tag width.
pub fn variant_tag(name: &str) -> [u8; ID_FIELD_SIZE] {
    let mut tag = [0u8; ID_FIELD_SIZE];
    for (dst, src) in tag.iter_mut().zip(name.as_bytes()) {
        *dst = *src;
    }
    tag
}

pub fn variant_to_string(tag: &[u8; ID_FIELD_SIZE]) -> String {
    let end = tag.iter().position(|b| *b == 0).unwrap_or(ID_FIELD_SIZE);
    String::from_utf8_lossy(&tag[..end]).into_owned()
}

/// Partition sub-header (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHeader {
    /// Flash bank index (big-endian).
    pub sqif: u16,
    /// Partition number (big-endian).
    pub partition: u16,
    /// First word of the partition payload (little-endian).
    pub first_word: u32,
}

impl PartitionHeader {
    pub const SIZE: usize = PARTITION_HEADER_SIZE;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            sqif: cursor.read_u16::<BigEndian>()?,
            partition: cursor.read_u16::<BigEndian>()?,
            first_word: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; PARTITION_HEADER_SIZE] {
        let mut buf = [0u8; PARTITION_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.sqif.to_be_bytes());
        buf[2..4].copy_from_slice(&self.partition.to_be_bytes());
        buf[4..8].copy_from_slice(&self.first_word.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> UpgradeHeader {
        UpgradeHeader {
            variant: variant_tag("QCC514X"),
            version: Version::new(2, 0),
            compatible_versions: vec![Version::new(1, 5), Version::new(1, WILDCARD_MINOR)],
            ps_config_version: 4,
            compatible_ps_configs: vec![3],
            signing_mode: 1,
        }
    }

    #[test]
    fn test_prefix_kind() {
        let prefix = SectionPrefix::new(SectionKind::Footer, 128);
        let bytes = prefix.to_bytes();
        assert_eq!(&bytes[..8], b"APPUPFTR");
        assert_eq!(&bytes[8..], &[0, 0, 0, 128]);

        let parsed = SectionPrefix::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.kind(), Some(SectionKind::Footer));
        assert_eq!(parsed.length, 128);

        let unknown = SectionPrefix::from_bytes(b"BOGUSHDR\0\0\0\x04").unwrap();
        assert_eq!(unknown.kind(), None);
    }

    #[test]
    fn test_upgrade_header_layout() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), UpgradeHeader::body_len(2, 1));
        assert_eq!(*bytes.last().unwrap(), 1);

        let parsed = UpgradeHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.variant_str(), "QCC514X");
    }

    #[test]
    fn test_upgrade_header_counts_checked_against_length() {
        let mut bytes = sample_header().to_bytes();
        // Claim 200 compatible versions in a short buffer.
        bytes[12] = 0;
        bytes[13] = 200;
        assert!(matches!(
            UpgradeHeader::from_bytes(&bytes),
            Err(HeaderError::BufferTooSmall { .. })
        ));

        let mut trailing = sample_header().to_bytes();
        trailing.push(0);
        assert!(matches!(
            UpgradeHeader::from_bytes(&trailing),
            Err(HeaderError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_wildcard_minor() {
        let entry = Version::new(1, WILDCARD_MINOR);
        assert!(entry.admits(Version::new(1, 9)));
        assert!(!entry.admits(Version::new(2, 9)));
        assert!(Version::new(1, 5).admits(Version::new(1, 5)));
        assert!(!Version::new(1, 5).admits(Version::new(1, 4)));
    }

    #[test]
    fn test_partition_header_endianness() {
        let bytes = [0x00, 0x00, 0x00, 0x05, 0x78, 0x56, 0x34, 0x12];
        let header = PartitionHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.sqif, 0);
        assert_eq!(header.partition, 5);
        assert_eq!(header.first_word, 0x1234_5678);
        assert_eq!(header.to_bytes(), bytes);
    }
}
