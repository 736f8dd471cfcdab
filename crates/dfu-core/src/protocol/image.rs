//! Whole-image helpers: building bench images and listing their sections.

use super::constants::*;
use super::header::{
    HeaderError, PartitionHeader, SectionKind, SectionPrefix, UpgradeHeader,
};
use crate::verify::bench_signature;

/// One partition as carried by an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionImage {
    pub sqif: u16,
    pub partition: u16,
    /// Partition content, first word included.
    pub content: Vec<u8>,
}

impl PartitionImage {
    pub fn first_word(&self) -> u32 {
        u32::from_le_bytes([
            self.content[0],
            self.content[1],
            self.content[2],
            self.content[3],
        ])
    }
}

/// Assembles header, partitions and footer into a complete image.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    header: UpgradeHeader,
    partitions: Vec<PartitionImage>,
    signature: Option<Vec<u8>>,
}

impl ImageBuilder {
    pub fn new(header: UpgradeHeader) -> Self {
        Self {
            header,
            partitions: Vec::new(),
            signature: None,
        }
    }

    /// Add a partition on SQIF 0. Content shorter than the first word is zero padded.
    pub fn partition(self, partition: u16, content: impl Into<Vec<u8>>) -> Self {
        self.partition_on(0, partition, content)
    }

    pub fn partition_on(mut self, sqif: u16, partition: u16, content: impl Into<Vec<u8>>) -> Self {
        let mut content = content.into();
        if content.len() < FIRST_WORD_SIZE {
            content.resize(FIRST_WORD_SIZE, 0);
        }
        self.partitions.push(PartitionImage {
            sqif,
            partition,
            content,
        });
        self
    }

    /// Use an explicit footer signature instead of the bench signature.
    pub fn signature(mut self, signature: impl Into<Vec<u8>>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn partitions(&self) -> &[PartitionImage] {
        &self.partitions
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();

        let header = self.header.to_bytes();
        out.extend_from_slice(
            &SectionPrefix::new(SectionKind::UpgradeHeader, header.len() as u32).to_bytes(),
        );
        out.extend_from_slice(&header);

        for part in &self.partitions {
            let declared = PARTITION_SECOND_HEADER_SIZE + part.content.len();
            out.extend_from_slice(
                &SectionPrefix::new(SectionKind::PartitionData, declared as u32).to_bytes(),
            );
            let sub = PartitionHeader {
                sqif: part.sqif,
                partition: part.partition,
                first_word: part.first_word(),
            };
            out.extend_from_slice(&sub.to_bytes());
            out.extend_from_slice(&part.content[FIRST_WORD_SIZE..]);
        }

        let signature = match &self.signature {
            Some(sig) => sig.clone(),
            None => {
                let mode = SigningMode::from_byte(self.header.signing_mode).unwrap_or_default();
                bench_signature(
                    mode,
                    self.partitions
                        .iter()
                        .map(|p| (p.partition, p.content.as_slice())),
                )
            }
        };
        out.extend_from_slice(
            &SectionPrefix::new(SectionKind::Footer, signature.len() as u32).to_bytes(),
        );
        out.extend_from_slice(&signature);
        out
    }
}

/// Location of one section inside an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    pub id: [u8; ID_FIELD_SIZE],
    pub kind: Option<SectionKind>,
    /// Offset of the section prefix.
    pub offset: usize,
    /// Declared body length.
    pub length: u32,
    /// Partition sub-header, for partition sections.
    pub partition: Option<PartitionHeader>,
}

/// Sections of a complete image, in order.
#[derive(Debug, Clone, Default)]
pub struct ImageLayout {
    pub sections: Vec<SectionInfo>,
    pub header: Option<UpgradeHeader>,
}

impl ImageLayout {
    /// Walk the section prefixes of `image`. Stops at the first unknown id.
    pub fn scan(image: &[u8]) -> Result<Self, HeaderError> {
        let mut layout = ImageLayout::default();
        let mut pos = 0usize;

        while pos < image.len() {
            let prefix = SectionPrefix::from_bytes(&image[pos..])?;
            let body_start = pos + SectionPrefix::SIZE;
            let body_end = body_start + prefix.length as usize;
            if body_end > image.len() {
                return Err(HeaderError::BufferTooSmall {
                    expected: body_end,
                    actual: image.len(),
                });
            }
            let body = &image[body_start..body_end];
            let kind = prefix.kind();

            let partition = match kind {
                Some(SectionKind::UpgradeHeader) => {
                    layout.header = Some(UpgradeHeader::from_bytes(body)?);
                    None
                }
                Some(SectionKind::PartitionData) => Some(PartitionHeader::from_bytes(body)?),
                _ => None,
            };

            layout.sections.push(SectionInfo {
                id: prefix.id,
                kind,
                offset: pos,
                length: prefix.length,
                partition,
            });

            if kind.is_none() {
                break;
            }
            pos = body_end;
        }

        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::{Version, variant_tag};

    fn header() -> UpgradeHeader {
        UpgradeHeader {
            variant: variant_tag("QCC514X"),
            version: Version::new(2, 0),
            compatible_versions: vec![Version::new(1, 5)],
            ps_config_version: 1,
            compatible_ps_configs: vec![],
            signing_mode: 0,
        }
    }

    #[test]
    fn test_build_and_scan() {
        let builder = ImageBuilder::new(header())
            .partition(5, vec![0xAA; 100])
            .partition(9, vec![0xBB; 10]);
        let image = builder.build();
        let layout = ImageLayout::scan(&image).unwrap();

        let kinds: Vec<_> = layout.sections.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                Some(SectionKind::UpgradeHeader),
                Some(SectionKind::PartitionData),
                Some(SectionKind::PartitionData),
                Some(SectionKind::Footer),
            ]
        );
        assert_eq!(layout.sections[1].length, 104);
        assert_eq!(layout.sections[1].partition.unwrap().partition, 5);
        assert_eq!(layout.sections[3].length, 128);
        assert_eq!(layout.header.unwrap().version, Version::new(2, 0));
    }

    #[test]
    fn test_short_partition_is_padded_to_first_word() {
        let builder = ImageBuilder::new(header()).partition(1, vec![0x01]);
        assert_eq!(builder.partitions()[0].content, vec![0x01, 0, 0, 0]);
        assert_eq!(builder.partitions()[0].first_word(), 1);
    }

    #[test]
    fn test_scan_stops_at_unknown_section() {
        let mut image = ImageBuilder::new(header()).build();
        image.extend_from_slice(b"XXXXXXXX\0\0\0\0");
        let layout = ImageLayout::scan(&image).unwrap();
        let last = layout.sections.last().unwrap();
        assert_eq!(last.kind, None);
        assert_eq!(&last.id, b"XXXXXXXX");
    }
}
