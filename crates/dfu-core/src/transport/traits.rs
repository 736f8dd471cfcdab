//! Image transport abstraction.
//!
//! The engine pulls the image through the `ImageSource` trait: it issues one
//! `DataRequest` at a time and consumes the deliveries answering it,
//! allowing different implementations (files, in-memory images, links).

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No request outstanding")]
    NoRequest,

    #[error("Source disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte range wanted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataRequest {
    /// Number of bytes to deliver.
    pub size: u32,
    /// Bytes to skip after the last byte delivered. The first request of a
    /// session skips from the start of the image.
    pub offset: u32,
}

impl DataRequest {
    pub const fn new(size: u32, offset: u32) -> Self {
        Self { size, offset }
    }
}

impl fmt::Display for DataRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes (+{})", self.size, self.offset)
    }
}

/// A chunk of image bytes answering the current request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delivery {
    pub data: Vec<u8>,
    /// This chunk completes the outstanding request.
    pub request_complete: bool,
    /// This chunk carries the last byte of the image.
    pub last_packet: bool,
}

/// Something the engine can pull image bytes from.
pub trait ImageSource {
    /// Issue a new request, replacing any outstanding one.
    fn request(&mut self, request: DataRequest) -> Result<(), TransportError>;

    /// Next chunk for the outstanding request, or `None` if it is exhausted.
    fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError>;

    /// Total image size, if known.
    fn total_len(&self) -> Option<u64> {
        None
    }
}
