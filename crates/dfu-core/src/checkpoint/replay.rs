//! Resume position recovered from mirrored header bytes.
//!
//! The mirror holds the upgrade header section followed by the prefix and
//! sub-header of every partition section seen so far, with any repeated
//! upgrade header recorded in place. Walking it against
//! `last_closed_partition` gives the image offset of the first section that
//! still needs work.

use tracing::{debug, warn};

use crate::protocol::{
    PARTITION_HEADER_SIZE, PartitionHeader, SectionKind, SectionPrefix, SigningMode,
    UpgradeHeader,
};

/// Where to pick the transfer up again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayPosition {
    /// Image offset of the next section prefix to request.
    pub file_offset: u32,
    /// Mirror cursor matching `file_offset`.
    pub mirror_cursor: usize,
    pub signing_mode: SigningMode,
    /// Partitions already complete, in image order.
    pub completed: Vec<u16>,
}

/// Replay mirrored headers. Returns `None` when the mirror does not start
/// with a complete, valid upgrade header.
pub fn replay_headers(mirror: &[u8], last_closed_partition: u16) -> Option<ReplayPosition> {
    let prefix = SectionPrefix::from_bytes(mirror).ok()?;
    if prefix.kind() != Some(SectionKind::UpgradeHeader) {
        warn!("Header mirror does not start with an upgrade header");
        return None;
    }
    let (signing_mode, header_end) = replay_upgrade_header(mirror, 0, prefix.length)?;

    let mut position = ReplayPosition {
        file_offset: header_end as u32,
        mirror_cursor: header_end,
        signing_mode,
        completed: Vec::new(),
    };

    loop {
        let start = position.mirror_cursor;
        let Some(Ok(prefix)) = mirror
            .get(start..start + SectionPrefix::SIZE)
            .map(SectionPrefix::from_bytes)
        else {
            break;
        };
        match prefix.kind() {
            Some(SectionKind::UpgradeHeader) => {
                let Some((mode, end)) = replay_upgrade_header(mirror, start, prefix.length) else {
                    break;
                };
                debug!(mode = %mode, "Replayed repeated upgrade header");
                position.signing_mode = mode;
                position.file_offset += (end - start) as u32;
                position.mirror_cursor = end;
            }
            Some(SectionKind::PartitionData) => {
                let record_end = start + SectionPrefix::SIZE + PARTITION_HEADER_SIZE;
                let Some(sub) = mirror
                    .get(start + SectionPrefix::SIZE..record_end)
                    .and_then(|bytes| PartitionHeader::from_bytes(bytes).ok())
                else {
                    break;
                };
                if sub.partition >= last_closed_partition {
                    break;
                }
                debug!(partition = sub.partition, "Replayed completed partition");
                position.completed.push(sub.partition);
                position.file_offset += SectionPrefix::SIZE as u32 + prefix.length;
                position.mirror_cursor = record_end;
            }
            _ => break,
        }
    }

    debug!(
        file_offset = position.file_offset,
        completed = position.completed.len(),
        "Header replay finished"
    );
    Some(position)
}

/// Decode the header record at `start`. Returns its signing mode and the
/// mirror offset just past its body.
fn replay_upgrade_header(mirror: &[u8], start: usize, length: u32) -> Option<(SigningMode, usize)> {
    let body = start + SectionPrefix::SIZE;
    let end = body + length as usize;
    let header = UpgradeHeader::from_bytes(mirror.get(body..end)?).ok()?;
    let signing_mode = SigningMode::from_byte(header.signing_mode).ok()?;
    Some((signing_mode, end))
}
