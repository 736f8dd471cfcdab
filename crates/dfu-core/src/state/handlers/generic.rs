//! Section prefix handler.

use tracing::{debug, error, info};

use crate::checkpoint::CheckpointStore;
use crate::error::DfuError;
use crate::events::{DfuEvent, DfuObserver, DfuPhase};
use crate::protocol::{
    HEADER_SLOT_SIZE, PARTITION_HEADER_SIZE, PARTITION_SECOND_HEADER_SIZE, SectionKind,
    SectionPrefix, UPGRADE_HEADER_MIN_SIZE, UpgradeHeader,
};
use crate::state::machine::ParserState;
use crate::storage::PartitionDriver;
use crate::verify::ImageVerifier;

use super::{HandleResult, HandlerContext};

/// Largest body the u16 entry counts can describe.
const UPGRADE_HEADER_MAX_SIZE: usize = UpgradeHeader::body_len(u16::MAX as usize, u16::MAX as usize);

/// Read `{id, length}` and route to the matching section handler.
pub fn handle_prefix<D, S, V, O>(
    data: &[u8],
    ctx: &mut HandlerContext<'_, D, S, V, O>,
) -> Result<HandleResult, DfuError>
where
    D: PartitionDriver + ?Sized,
    S: CheckpointStore + ?Sized,
    V: ImageVerifier + ?Sized,
    O: DfuObserver + ?Sized,
{
    let prefix = SectionPrefix::from_bytes(data)
        .map_err(|_| DfuError::TooShort { actual: data.len() })?;
    let prefix_bytes = &data[..SectionPrefix::SIZE];
    let length = prefix.length as usize;

    match prefix.kind() {
        Some(SectionKind::UpgradeHeader) => {
            if !(UPGRADE_HEADER_MIN_SIZE..=UPGRADE_HEADER_MAX_SIZE).contains(&length) {
                return Err(DfuError::BadLengthUpgradeHeader { length });
            }
            // Later headers follow the records already mirrored.
            let start = if ctx.state.header_seen {
                ctx.state.mirror.cursor()
            } else {
                0
            };
            let capacity = ctx.store.slot_count() * HEADER_SLOT_SIZE;
            if ctx.config.store_headers && start + SectionPrefix::SIZE + length > capacity {
                error!(length, start, capacity, "Upgrade header does not fit the header slots");
                return Err(DfuError::NoMemory);
            }
            if !ctx.state.header_seen {
                ctx.state.mirror.restart();
            }
            ctx.mirror(prefix_bytes)?;

            debug!(length, "Upgrade header section");
            ctx.state.goto_state(ParserState::Header);
            Ok(HandleResult::Request(ctx.state.request(prefix.length, 0)))
        }
        Some(SectionKind::PartitionData) => {
            if !ctx.state.header_seen {
                return Err(DfuError::MissingUpgradeHeader);
            }
            if length < PARTITION_HEADER_SIZE {
                return Err(DfuError::BadLengthPartitionHeader { length });
            }
            ctx.mirror(prefix_bytes)?;

            ctx.state.partition_length = prefix.length - PARTITION_SECOND_HEADER_SIZE as u32;
            debug!(
                partition_length = ctx.state.partition_length,
                "Partition section"
            );
            ctx.state.goto_state(ParserState::DataHeader);
            Ok(HandleResult::Request(
                ctx.state.request(PARTITION_HEADER_SIZE as u32, 0),
            ))
        }
        Some(SectionKind::Footer) => {
            if !ctx.state.header_seen {
                return Err(DfuError::MissingUpgradeHeader);
            }
            let expected = ctx.state.signing_mode.signature_size();
            if length != expected {
                return Err(DfuError::BadLengthSignature {
                    expected,
                    actual: length,
                });
            }

            let mut signature = Vec::new();
            signature
                .try_reserve_exact(expected)
                .map_err(|_| DfuError::SignatureAllocation { size: expected })?;
            ctx.state.signature = signature;

            info!(mode = %ctx.state.signing_mode, "Footer section");
            ctx.emit(DfuEvent::PhaseChanged {
                from: DfuPhase::Transfer,
                to: DfuPhase::Verifying,
            });
            ctx.state.goto_state(ParserState::Footer);
            Ok(HandleResult::Request(ctx.state.request(prefix.length, 0)))
        }
        None => Err(DfuError::UnknownId { id: prefix.id }),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::protocol::SigningMode;
    use crate::transport::DataRequest;

    fn prefix(kind: SectionKind, length: u32) -> [u8; 12] {
        SectionPrefix::new(kind, length).to_bytes()
    }

    #[test]
    fn test_header_prefix() {
        let mut fx = Fixture::new();
        fx.expect(ParserState::Generic, 12);
        let result = fx.feed(&prefix(SectionKind::UpgradeHeader, 23)).unwrap();
        assert_eq!(result, HandleResult::Request(DataRequest::new(23, 0)));
        assert_eq!(fx.state.state, ParserState::Header);
        assert_eq!(fx.store.read_slot(0).unwrap().len(), 12);
    }

    #[test]
    fn test_header_too_short() {
        let mut fx = Fixture::new();
        fx.expect(ParserState::Generic, 12);
        assert!(matches!(
            fx.feed(&prefix(SectionKind::UpgradeHeader, 18)),
            Err(DfuError::BadLengthUpgradeHeader { length: 18 })
        ));
    }

    #[test]
    fn test_header_length_beyond_entry_counts() {
        let mut fx = Fixture::new();
        fx.config.store_headers = false;
        fx.expect(ParserState::Generic, 12);
        assert!(matches!(
            fx.feed(&prefix(SectionKind::UpgradeHeader, 0x7FFF_FFFF)),
            Err(DfuError::BadLengthUpgradeHeader { length: 0x7FFF_FFFF })
        ));
        assert!(fx.state.pending.is_empty());
    }

    #[test]
    fn test_header_must_fit_slots_when_mirroring() {
        let mut fx = Fixture::new();
        fx.expect(ParserState::Generic, 12);
        let err = fx
            .feed(&prefix(SectionKind::UpgradeHeader, 2000))
            .unwrap_err();
        assert!(matches!(err, DfuError::NoMemory));
        assert_eq!(err.class(), crate::error::ErrorClass::Resource);
        assert!(fx.store.read_slot(0).unwrap().is_empty());

        fx.config.store_headers = false;
        fx.expect(ParserState::Generic, 12);
        let result = fx.feed(&prefix(SectionKind::UpgradeHeader, 2000)).unwrap();
        assert_eq!(result, HandleResult::Request(DataRequest::new(2000, 0)));
    }

    #[test]
    fn test_second_header_appends_to_mirror() {
        let mut fx = Fixture::new();
        fx.expect(ParserState::Generic, 12);
        fx.feed(&prefix(SectionKind::UpgradeHeader, 23)).unwrap();
        assert_eq!(fx.state.mirror.cursor(), 12);

        fx.state.header_seen = true;
        fx.expect(ParserState::Generic, 12);
        fx.feed(&prefix(SectionKind::UpgradeHeader, 23)).unwrap();
        assert_eq!(fx.state.mirror.cursor(), 24);
        assert_eq!(fx.store.read_slot(0).unwrap().len(), 24);
    }

    #[test]
    fn test_short_delivery() {
        let mut fx = Fixture::new();
        fx.expect(ParserState::Generic, 12);
        assert!(matches!(
            fx.feed(b"APPU"),
            Err(DfuError::TooShort { actual: 4 })
        ));
    }

    #[test]
    fn test_partition_requires_header() {
        let mut fx = Fixture::new();
        fx.expect(ParserState::Generic, 12);
        assert!(matches!(
            fx.feed(&prefix(SectionKind::PartitionData, 100)),
            Err(DfuError::MissingUpgradeHeader)
        ));
    }

    #[test]
    fn test_partition_prefix() {
        let mut fx = Fixture::new();
        fx.state.header_seen = true;
        fx.expect(ParserState::Generic, 12);
        let result = fx.feed(&prefix(SectionKind::PartitionData, 1028)).unwrap();
        assert_eq!(result, HandleResult::Request(DataRequest::new(8, 0)));
        assert_eq!(fx.state.partition_length, 1024);
        assert_eq!(fx.state.state, ParserState::DataHeader);

        fx.expect(ParserState::Generic, 12);
        assert!(matches!(
            fx.feed(&prefix(SectionKind::PartitionData, 7)),
            Err(DfuError::BadLengthPartitionHeader { length: 7 })
        ));
    }

    #[test]
    fn test_footer_length_must_match_signing_mode() {
        let mut fx = Fixture::new();
        fx.state.header_seen = true;
        fx.state.signing_mode = SigningMode::Rsa2048;

        fx.expect(ParserState::Generic, 12);
        assert!(matches!(
            fx.feed(&prefix(SectionKind::Footer, 128)),
            Err(DfuError::BadLengthSignature {
                expected: 256,
                actual: 128
            })
        ));

        fx.expect(ParserState::Generic, 12);
        let result = fx.feed(&prefix(SectionKind::Footer, 256)).unwrap();
        assert_eq!(result, HandleResult::Request(DataRequest::new(256, 0)));
        assert!(fx.state.signature.capacity() >= 256);
    }

    #[test]
    fn test_unknown_id() {
        let mut fx = Fixture::new();
        fx.expect(ParserState::Generic, 12);
        assert!(matches!(
            fx.feed(b"NOTASECT\0\0\0\x10"),
            Err(DfuError::UnknownId { .. })
        ));
    }
}
