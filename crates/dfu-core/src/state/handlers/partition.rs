//! Partition sub-header handler and resume logic.

use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::DfuError;
use crate::events::{DfuEvent, DfuObserver, LogLevel};
use crate::protocol::{FIRST_WORD_SIZE, PartitionHeader, PartitionKind};
use crate::state::machine::ParserState;
use crate::storage::{PartitionDriver, PartitionHandle};
use crate::verify::ImageVerifier;

use super::{HandleResult, HandlerContext};

/// Validate the partition sub-header and position the transfer.
///
/// Partitions already closed by an earlier run are skipped without opening
/// them; partially written ones continue from the driver's offset.
pub fn handle_partition_header<D, S, V, O>(
    data: &[u8],
    ctx: &mut HandlerContext<'_, D, S, V, O>,
) -> Result<HandleResult, DfuError>
where
    D: PartitionDriver + ?Sized,
    S: CheckpointStore + ?Sized,
    V: ImageVerifier + ?Sized,
    O: DfuObserver + ?Sized,
{
    let sub = PartitionHeader::from_bytes(data)
        .map_err(|_| DfuError::BadLengthPartitionHeader { length: data.len() })?;
    let number = sub.partition;

    let kind = PartitionKind::upgradable(number).ok_or(DfuError::WrongPartitionNumber(number))?;
    if sub.sqif != kind.expected_sqif() {
        return Err(DfuError::PartitionTypeNotMatching {
            partition: number,
            sqif: sub.sqif,
        });
    }

    ctx.mirror(&data[..PartitionHeader::SIZE])?;
    ctx.state.image_partitions.push(number);

    let length = ctx.state.partition_length;
    let payload = length.saturating_sub(FIRST_WORD_SIZE as u32);

    if ctx.checkpoint.is_closed(number) {
        info!(partition = number, kind = %kind, "Partition already written, skipping");
        ctx.emit(DfuEvent::PartitionSkipped { partition: number });
        return Ok(HandleResult::Request(ctx.state.request_next_section(payload)));
    }

    let capacity = ctx.driver.physical_capacity(number)?;
    if length > capacity {
        return Err(DfuError::PartitionSizeMismatch {
            partition: number,
            required: length,
            capacity,
        });
    }

    let handle = open_or_reuse(ctx, number, sub.first_word)?;
    let offset = ctx.driver.offset(&handle);

    if offset < payload {
        let remaining = payload - offset;
        debug!(partition = number, offset, remaining, "Writing partition");
        if offset > 0 {
            ctx.log(
                LogLevel::Info,
                format!("Partition {} resumes at offset {}", number, offset),
            );
        }
        *ctx.handle = Some(handle);
        ctx.state.open_next_partition = false;
        ctx.state.goto_state(ParserState::Data);
        Ok(HandleResult::Request(ctx.state.request(remaining, offset)))
    } else if offset == payload {
        // All data on flash but the partition was never closed.
        info!(partition = number, "Partition complete but open, closing");
        ctx.close_partition(handle)?;
        Ok(HandleResult::Request(ctx.state.request_next_section(offset)))
    } else {
        *ctx.handle = Some(handle);
        Err(DfuError::OffsetPastPartition {
            partition: number,
            offset,
            length,
        })
    }
}

/// Keep an already open handle for the same partition, otherwise open one.
fn open_or_reuse<D, S, V, O>(
    ctx: &mut HandlerContext<'_, D, S, V, O>,
    number: u16,
    first_word: u32,
) -> Result<PartitionHandle, DfuError>
where
    D: PartitionDriver + ?Sized,
    S: CheckpointStore + ?Sized,
    V: ImageVerifier + ?Sized,
    O: DfuObserver + ?Sized,
{
    match ctx.handle.take() {
        Some(handle) if handle.partition() == number && !ctx.state.open_next_partition => {
            debug!(partition = number, "Reusing open partition handle");
            return Ok(handle);
        }
        Some(stale) => {
            let partition = stale.partition();
            warn!(partition, "Closing stale partition handle");
            ctx.driver
                .close(stale)
                .map_err(|source| DfuError::PartitionCloseFailed { partition, source })?;
        }
        None => {}
    }

    ctx.driver
        .open(number, first_word)
        .map_err(|source| DfuError::PartitionOpenFailed {
            partition: number,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::transport::DataRequest;

    fn sub(partition: u16) -> [u8; 8] {
        PartitionHeader {
            sqif: 0,
            partition,
            first_word: 0xA5A5_A5A5,
        }
        .to_bytes()
    }

    fn fixture(partition_length: u32) -> Fixture {
        let mut fx = Fixture::new();
        fx.state.header_seen = true;
        fx.state.partition_length = partition_length;
        fx.expect(ParserState::DataHeader, 8);
        fx
    }

    #[test]
    fn test_fresh_partition_opens_and_requests_payload() {
        let mut fx = fixture(1028);
        let result = fx.feed(&sub(5)).unwrap();
        assert_eq!(result, HandleResult::Request(DataRequest::new(1024, 0)));
        assert_eq!(fx.state.state, ParserState::Data);
        assert_eq!(fx.handle.as_ref().map(|h| h.partition()), Some(5));
        assert_eq!(fx.state.image_partitions, vec![5]);
    }

    #[test]
    fn test_user_data_partition_rejected_without_open() {
        let mut fx = fixture(1028);
        assert!(matches!(
            fx.feed(&sub(7)),
            Err(DfuError::WrongPartitionNumber(7))
        ));
        assert!(fx.handle.is_none());
        assert_eq!(fx.driver.open_count(), 0);
    }

    #[test]
    fn test_wrong_sqif() {
        let mut fx = fixture(1028);
        let bytes = PartitionHeader {
            sqif: 1,
            partition: 5,
            first_word: 0,
        }
        .to_bytes();
        assert!(matches!(
            fx.feed(&bytes),
            Err(DfuError::PartitionTypeNotMatching { partition: 5, sqif: 1 })
        ));
    }

    #[test]
    fn test_closed_partition_is_skipped() {
        let mut fx = fixture(1028);
        fx.checkpoint.record_closed(5);
        let result = fx.feed(&sub(5)).unwrap();
        assert_eq!(result, HandleResult::Request(DataRequest::new(12, 1024)));
        assert_eq!(fx.state.state, ParserState::Generic);
        assert_eq!(fx.driver.open_count(), 0);
    }

    #[test]
    fn test_partition_larger_than_capacity() {
        let mut fx = fixture(1028);
        fx.driver.set_capacity(5, 1000);
        assert!(matches!(
            fx.feed(&sub(5)),
            Err(DfuError::PartitionSizeMismatch {
                partition: 5,
                required: 1028,
                capacity: 1000
            })
        ));
    }

    #[test]
    fn test_partial_partition_resumes_at_offset() {
        let mut fx = fixture(1028);
        let handle = fx.driver.open(5, 0).unwrap();
        fx.driver.write(&handle, &[0u8; 300]);
        fx.driver.power_cut();

        let result = fx.feed(&sub(5)).unwrap();
        assert_eq!(result, HandleResult::Request(DataRequest::new(724, 300)));
    }

    #[test]
    fn test_fully_written_partition_closed_immediately() {
        let mut fx = fixture(1028);
        let handle = fx.driver.open(5, 0).unwrap();
        fx.driver.write(&handle, &[0u8; 1024]);
        fx.driver.power_cut();

        let result = fx.feed(&sub(5)).unwrap();
        assert_eq!(result, HandleResult::Request(DataRequest::new(12, 1024)));
        assert!(fx.driver.is_closed(5));
        assert_eq!(fx.store.snapshot().last_closed_partition, 6);
        assert!(fx.handle.is_none());
    }

    #[test]
    fn test_offset_past_partition() {
        let mut fx = fixture(104);
        let handle = fx.driver.open(5, 0).unwrap();
        fx.driver.write(&handle, &[0u8; 200]);
        fx.driver.power_cut();

        assert!(matches!(
            fx.feed(&sub(5)),
            Err(DfuError::OffsetPastPartition { partition: 5, offset: 200, length: 104 })
        ));
        assert!(fx.handle.is_some());
    }

    #[test]
    fn test_open_failure() {
        let mut fx = fixture(1028);
        fx.driver.fail_open(true);
        assert!(matches!(
            fx.feed(&sub(5)),
            Err(DfuError::PartitionOpenFailed { partition: 5, .. })
        ));
    }

    #[test]
    fn test_reuses_handle_for_same_partition() {
        let mut fx = fixture(1028);
        let handle = fx.driver.open(5, 0).unwrap();
        fx.driver.write(&handle, &[0u8; 10]);
        fx.handle = Some(handle);
        fx.state.open_next_partition = false;

        let result = fx.feed(&sub(5)).unwrap();
        assert_eq!(result, HandleResult::Request(DataRequest::new(1014, 10)));
        assert_eq!(fx.driver.open_count(), 1);
    }
}
