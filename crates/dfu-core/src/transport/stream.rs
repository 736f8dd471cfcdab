//! Seekable image sources: in-memory buffers and files.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::trace;

use super::traits::{DataRequest, Delivery, ImageSource, TransportError};

#[derive(Debug, Clone, Copy)]
struct Pending {
    /// Absolute position of the next byte to deliver.
    next: u64,
    /// Absolute end of the requested range.
    end: u64,
}

/// Serves requests from any `Read + Seek` in fragments of a fixed size.
pub struct StreamSource<R> {
    reader: R,
    len: u64,
    fragment: usize,
    /// Absolute position after the last byte delivered.
    position: u64,
    pending: Option<Pending>,
}

/// Image held in memory.
pub type SliceSource = StreamSource<Cursor<Vec<u8>>>;

/// Image read from disk.
pub type FileSource = StreamSource<File>;

impl<R: Read + Seek> StreamSource<R> {
    pub fn new(mut reader: R, fragment: usize) -> Result<Self, TransportError> {
        let len = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            reader,
            len,
            fragment: fragment.max(1),
            position: 0,
            pending: None,
        })
    }

    pub fn fragment(&self) -> usize {
        self.fragment
    }

    /// Absolute position after the last byte delivered.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl SliceSource {
    pub fn from_bytes(image: impl Into<Vec<u8>>, fragment: usize) -> Self {
        let image = image.into();
        let len = image.len() as u64;
        Self {
            reader: Cursor::new(image),
            len,
            fragment: fragment.max(1),
            position: 0,
            pending: None,
        }
    }
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>, fragment: usize) -> Result<Self, TransportError> {
        Self::new(File::open(path)?, fragment)
    }
}

impl<R: Read + Seek> ImageSource for StreamSource<R> {
    fn request(&mut self, request: DataRequest) -> Result<(), TransportError> {
        let start = self.position + u64::from(request.offset);
        let end = start + u64::from(request.size);
        self.position = start;
        self.pending = Some(Pending { next: start, end });
        trace!(start, end, "Request queued");
        Ok(())
    }

    fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError> {
        let Some(mut pending) = self.pending else {
            return Err(TransportError::NoRequest);
        };
        if pending.next >= pending.end {
            return Ok(None);
        }

        let chunk_end = pending
            .end
            .min(pending.next + self.fragment as u64)
            .min(self.len);
        let mut data = vec![0u8; chunk_end.saturating_sub(pending.next) as usize];
        if !data.is_empty() {
            self.reader.seek(SeekFrom::Start(pending.next))?;
            self.reader.read_exact(&mut data)?;
        }

        let last_packet = chunk_end >= self.len;
        self.position = chunk_end.max(self.position);
        // A truncated image ends the request early.
        pending.next = if last_packet { pending.end } else { chunk_end };
        self.pending = Some(pending);

        Ok(Some(Delivery {
            data,
            request_complete: chunk_end == pending.end,
            last_packet,
        }))
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.len)
    }
}
