//! Scripted image source for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{DataRequest, Delivery, ImageSource, TransportError};

#[derive(Debug, Default)]
struct Inner {
    deliveries: VecDeque<Delivery>,
    requests: Vec<DataRequest>,
    connected: bool,
}

/// Source that replays queued deliveries and captures requests.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connected: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a delivery returned by a later `next_delivery`.
    pub fn queue(&self, data: &[u8], request_complete: bool, last_packet: bool) {
        self.lock().deliveries.push_back(Delivery {
            data: data.to_vec(),
            request_complete,
            last_packet,
        });
    }

    /// All requests issued so far.
    pub fn requests(&self) -> Vec<DataRequest> {
        self.lock().requests.clone()
    }

    /// Simulate the link going away.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageSource for ScriptedSource {
    fn request(&mut self, request: DataRequest) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(TransportError::Disconnected);
        }
        inner.requests.push(request);
        Ok(())
    }

    fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(TransportError::Disconnected);
        }
        Ok(inner.deliveries.pop_front())
    }
}
