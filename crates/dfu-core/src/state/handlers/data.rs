//! Partition payload handler.

use tracing::{debug, error};

use crate::checkpoint::CheckpointStore;
use crate::error::DfuError;
use crate::events::{DfuEvent, DfuObserver};
use crate::storage::PartitionDriver;
use crate::verify::ImageVerifier;

use super::{HandleResult, HandlerContext};

/// Stream payload bytes into the open partition.
pub fn handle_data<D, S, V, O>(
    data: &[u8],
    request_complete: bool,
    ctx: &mut HandlerContext<'_, D, S, V, O>,
) -> Result<HandleResult, DfuError>
where
    D: PartitionDriver + ?Sized,
    S: CheckpointStore + ?Sized,
    V: ImageVerifier + ?Sized,
    O: DfuObserver + ?Sized,
{
    let Some(handle) = ctx.handle.as_ref() else {
        error!("Payload delivered with no open partition");
        return Err(DfuError::InvalidState);
    };
    let partition = handle.partition();

    let written = ctx.driver.write(handle, data);
    if written != data.len() {
        error!(partition, requested = data.len(), written, "Short partition write");
        return Err(DfuError::PartitionWriteFailed {
            partition,
            requested: data.len(),
            written,
        });
    }

    ctx.emit(DfuEvent::Progress {
        partition,
        current: u64::from(ctx.state.total_received),
        total: u64::from(ctx.state.total_requested),
    });

    if !request_complete {
        return Ok(HandleResult::AwaitMore);
    }

    let remaining = ctx.state.remaining();
    if remaining != 0 {
        error!(partition, remaining, "Delivery marked complete with payload missing");
        return Err(DfuError::FileTooSmall);
    }

    debug!(partition, "Partition payload complete");
    if let Some(handle) = ctx.handle.take() {
        ctx.close_partition(handle)?;
    }
    Ok(HandleResult::Request(ctx.state.request_next_section(0)))
}
