//! Parser state for the section dispatcher.

use std::fmt;

use crate::checkpoint::HeaderMirror;
use crate::protocol::SigningMode;
use crate::transport::DataRequest;

/// Which part of the image the dispatcher expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserState {
    /// 12-byte `{id, length}` prefix of the next section.
    #[default]
    Generic,
    /// Body of the upgrade header.
    Header,
    /// Partition sub-header (SQIF, number, first word).
    DataHeader,
    /// Partition payload.
    Data,
    /// Footer signature.
    Footer,
    /// Footer verified; nothing more is accepted.
    Complete,
}

impl fmt::Display for ParserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParserState::Generic => write!(f, "GENERIC"),
            ParserState::Header => write!(f, "HEADER"),
            ParserState::DataHeader => write!(f, "DATA_HEADER"),
            ParserState::Data => write!(f, "DATA"),
            ParserState::Footer => write!(f, "FOOTER"),
            ParserState::Complete => write!(f, "COMPLETE"),
        }
    }
}

impl ParserState {
    /// States whose input must be whole before it is parsed.
    pub fn buffers_partial(&self) -> bool {
        matches!(
            self,
            ParserState::Generic | ParserState::Header | ParserState::DataHeader
        )
    }
}

/// In-flight parser context. Owned by one session; mutated only by the
/// dispatcher and its handlers.
#[derive(Debug)]
pub struct SessionState {
    pub state: ParserState,
    /// Size of the outstanding request.
    pub total_requested: u32,
    /// Bytes received against the outstanding request.
    pub total_received: u32,
    pub next_request: DataRequest,
    /// Declared partition length minus the SQIF/number pair, first word included.
    pub partition_length: u32,
    pub open_next_partition: bool,
    pub header_seen: bool,
    pub signing_mode: SigningMode,
    /// Partial section bytes waiting for the rest of their request.
    pub pending: Vec<u8>,
    pub signature: Vec<u8>,
    pub mirror: HeaderMirror,
    /// Partitions carried by the image, in order.
    pub image_partitions: Vec<u16>,
}

impl SessionState {
    pub fn new(signing_mode: SigningMode) -> Self {
        Self {
            state: ParserState::Generic,
            total_requested: 0,
            total_received: 0,
            next_request: DataRequest::default(),
            partition_length: 0,
            open_next_partition: true,
            header_seen: false,
            signing_mode,
            pending: Vec::new(),
            signature: Vec::new(),
            mirror: HeaderMirror::new(),
            image_partitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: ParserState) {
        if self.state != new_state {
            tracing::debug!(from = %self.state, to = %new_state, "State transition");
        }
        self.state = new_state;
    }

    /// Issue a new request; resets the received count.
    pub fn request(&mut self, size: u32, offset: u32) -> DataRequest {
        let request = DataRequest::new(size, offset);
        self.next_request = request;
        self.total_requested = size;
        self.total_received = 0;
        request
    }

    /// Bytes still owed on the outstanding request.
    pub fn remaining(&self) -> u32 {
        self.total_requested.saturating_sub(self.total_received)
    }

    /// Request the next section prefix, skipping `skip` bytes.
    pub fn request_next_section(&mut self, skip: u32) -> DataRequest {
        self.goto_state(ParserState::Generic);
        self.request(crate::protocol::SECTION_PREFIX_SIZE as u32, skip)
    }
}
