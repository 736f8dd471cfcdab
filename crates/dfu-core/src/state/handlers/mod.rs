//! Section handlers - dispatch logic for each parser state.
//!
//! This module is split into submodules by section:
//! - `generic`: 12-byte section prefix routing
//! - `header`: upgrade header validation
//! - `partition`: partition sub-header, resume short-circuit, handle opening
//! - `data`: payload writes and partition close
//! - `footer`: signature collection and final verification

mod data;
mod footer;
mod generic;
mod header;
mod partition;

use tracing::debug;

use crate::checkpoint::{CheckpointStore, PersistedCheckpoint};
use crate::engine::EngineConfig;
use crate::error::DfuError;
use crate::events::{DfuEvent, DfuObserver, LogLevel};
use crate::state::machine::{ParserState, SessionState};
use crate::storage::{PartitionDriver, PartitionHandle};
use crate::transport::DataRequest;
use crate::verify::ImageVerifier;

/// Result of handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Send this request to the source.
    Request(DataRequest),
    /// Keep delivering against the outstanding request.
    AwaitMore,
    /// Footer verified; the image is complete.
    TransferComplete,
}

/// Handler context containing all resources.
pub struct HandlerContext<'a, D, S, V, O>
where
    D: PartitionDriver + ?Sized,
    S: CheckpointStore + ?Sized,
    V: ImageVerifier + ?Sized,
    O: DfuObserver + ?Sized,
{
    pub driver: &'a D,
    pub store: &'a S,
    pub verifier: &'a V,
    pub observer: &'a O,
    pub config: &'a EngineConfig,
    pub state: &'a mut SessionState,
    pub checkpoint: &'a mut PersistedCheckpoint,
    /// The one open partition, if any.
    pub handle: &'a mut Option<PartitionHandle>,
}

impl<D, S, V, O> HandlerContext<'_, D, S, V, O>
where
    D: PartitionDriver + ?Sized,
    S: CheckpointStore + ?Sized,
    V: ImageVerifier + ?Sized,
    O: DfuObserver + ?Sized,
{
    pub(crate) fn emit(&self, event: DfuEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(DfuEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn save_checkpoint(&mut self) -> Result<(), DfuError> {
        self.store.save(self.checkpoint)?;
        Ok(())
    }

    /// Mirror header bytes into the checkpoint slots when enabled.
    pub(crate) fn mirror(&mut self, data: &[u8]) -> Result<(), DfuError> {
        if self.config.store_headers {
            self.state.mirror.append(self.store, data)?;
        }
        Ok(())
    }

    /// Close `handle` and record it in the checkpoint.
    pub(crate) fn close_partition(&mut self, handle: PartitionHandle) -> Result<(), DfuError> {
        let partition = handle.partition();
        self.state.open_next_partition = true;
        self.driver
            .close(handle)
            .map_err(|source| DfuError::PartitionCloseFailed { partition, source })?;

        self.checkpoint.record_closed(partition);
        self.save_checkpoint()?;
        self.emit(DfuEvent::PartitionClosed { partition });
        Ok(())
    }
}

/// Route one delivery to the handler for the current parser state.
pub fn dispatch<D, S, V, O>(
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
    if ctx.state.state == ParserState::Complete {
        return Err(DfuError::FileTooBig);
    }

    let received = ctx.state.total_received as usize + data.len();
    if received > ctx.state.total_requested as usize {
        return Err(DfuError::Overrun {
            expected: ctx.state.total_requested as usize,
            actual: received,
        });
    }
    ctx.state.total_received = received as u32;

    if ctx.state.state.buffers_partial() {
        if !request_complete {
            ctx.state.pending.extend_from_slice(data);
            let remaining = ctx.state.remaining();
            debug!(state = %ctx.state.state, buffered = ctx.state.pending.len(), remaining, "Partial section, re-requesting");
            return Ok(HandleResult::Request(ctx.state.request(remaining, 0)));
        }

        let joined;
        let input: &[u8] = if ctx.state.pending.is_empty() {
            data
        } else {
            let mut buf = std::mem::take(&mut ctx.state.pending);
            buf.extend_from_slice(data);
            joined = buf;
            &joined
        };

        return match ctx.state.state {
            ParserState::Generic => generic::handle_prefix(input, ctx),
            ParserState::Header => header::handle_header(input, ctx),
            _ => partition::handle_partition_header(input, ctx),
        };
    }

    match ctx.state.state {
        ParserState::Data => data::handle_data(data, request_complete, ctx),
        _ => footer::handle_footer(data, request_complete, ctx),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::Fixture;
    use super::*;

    #[test]
    fn test_partial_prefix_is_buffered_and_rerequested() {
        let mut fx = Fixture::new();
        fx.expect(ParserState::Generic, 12);

        let result = fx.feed_partial(b"APPUH", false).unwrap();
        assert_eq!(result, HandleResult::Request(DataRequest::new(7, 0)));
        assert_eq!(fx.state.pending, b"APPUH");
        assert_eq!(fx.state.state, ParserState::Generic);
    }

    #[test]
    fn test_overrun_rejected() {
        let mut fx = Fixture::new();
        fx.expect(ParserState::Generic, 12);
        assert!(matches!(
            fx.feed(&[0u8; 13]),
            Err(DfuError::Overrun {
                expected: 12,
                actual: 13
            })
        ));
    }

    #[test]
    fn test_nothing_accepted_after_completion() {
        let mut fx = Fixture::new();
        fx.state.goto_state(ParserState::Complete);
        assert!(matches!(fx.feed(b"x"), Err(DfuError::FileTooBig)));
    }
}
