//! Upgrade engine - owns one ingestion session and its collaborators.
//!
//! The engine is single threaded and cooperative: the caller pulls
//! `DataRequest`s out of it, fetches the bytes from wherever the image
//! lives and feeds the deliveries back in. Exactly one request is
//! outstanding at a time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::mirror::read_mirror;
use crate::checkpoint::{
    CheckpointStore, HeaderMirror, PartitionsState, PersistedCheckpoint, ResumePoint,
    replay_headers,
};
use crate::error::DfuError;
use crate::events::{DfuEvent, DfuObserver, DfuPhase, TracingObserver};
use crate::protocol::{SigningMode, Version};
use crate::state::handlers::{HandleResult, HandlerContext, dispatch};
use crate::state::machine::{ParserState, SessionState};
use crate::storage::{EraseStatus, PartitionDriver, PartitionHandle};
use crate::transport::{DataRequest, Delivery};
use crate::verify::ImageVerifier;

/// Device identity and engine policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Variant tag the image must carry. Empty accepts any variant.
    pub device_variant: String,
    /// Application version currently running.
    pub running_version: Version,
    /// PS-config version currently running.
    pub running_config_version: u16,
    /// Signing mode assumed until an upgrade header names one.
    pub signing_mode: SigningMode,
    /// Mirror header bytes into checkpoint slots for exact resume offsets.
    pub store_headers: bool,
    /// Always erase and start over, ignoring any checkpoint.
    pub force_erase: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_variant: String::new(),
            running_version: Version::default(),
            running_config_version: 0,
            signing_mode: SigningMode::default(),
            store_headers: true,
            force_erase: false,
        }
    }
}

/// How a session got going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// Issue this request to the source.
    Ready(DataRequest),
    /// Bank erase is running; poll `poll_erase` before sending data.
    WaitForErase,
}

/// One image ingestion session.
pub struct UpgradeSession<D, S, V, O = TracingObserver>
where
    D: PartitionDriver,
    S: CheckpointStore,
    V: ImageVerifier,
    O: DfuObserver,
{
    driver: D,
    store: S,
    verifier: V,
    observer: Arc<O>,
    config: EngineConfig,
    state: SessionState,
    checkpoint: PersistedCheckpoint,
    handle: Option<PartitionHandle>,
    phase: DfuPhase,
    erase_pending: bool,
    failed: bool,
}

impl<D, S, V> UpgradeSession<D, S, V, TracingObserver>
where
    D: PartitionDriver,
    S: CheckpointStore,
    V: ImageVerifier,
{
    /// Create a session with the default tracing observer.
    pub fn new(driver: D, store: S, verifier: V, config: EngineConfig) -> Self {
        Self::with_observer(driver, store, verifier, config, Arc::new(TracingObserver))
    }
}

impl<D, S, V, O> UpgradeSession<D, S, V, O>
where
    D: PartitionDriver,
    S: CheckpointStore,
    V: ImageVerifier,
    O: DfuObserver,
{
    /// Create a session with a custom observer.
    pub fn with_observer(
        driver: D,
        store: S,
        verifier: V,
        config: EngineConfig,
        observer: Arc<O>,
    ) -> Self {
        let state = SessionState::new(config.signing_mode);
        Self {
            driver,
            store,
            verifier,
            observer,
            config,
            state,
            checkpoint: PersistedCheckpoint::default(),
            handle: None,
            phase: DfuPhase::Idle,
            erase_pending: false,
            failed: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> &PersistedCheckpoint {
        &self.checkpoint
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> DfuPhase {
        self.phase
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_complete(&self) -> bool {
        self.state.state == ParserState::Complete
    }

    pub fn has_open_partition(&self) -> bool {
        self.handle.is_some()
    }

    fn set_phase(&mut self, to: DfuPhase) {
        if self.phase != to {
            self.observer.on_event(&DfuEvent::PhaseChanged {
                from: self.phase,
                to,
            });
            self.phase = to;
        }
    }

    /// Begin or resume an upgrade from the persisted checkpoint.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<Start, DfuError> {
        self.failed = false;
        self.state = SessionState::new(self.config.signing_mode);
        self.checkpoint = self.store.load()?;

        if !self.config.force_erase && self.checkpoint.can_resume() {
            info!(
                last_closed = self.checkpoint.last_closed_partition,
                "Checkpoint found, resuming without erase"
            );
            let request = self.resume_request()?;
            return Ok(Start::Ready(request));
        }

        info!(force = self.config.force_erase, "Starting fresh upgrade");
        self.checkpoint.last_closed_partition = 0;
        self.checkpoint.resume_point = ResumePoint::Transfer;
        self.checkpoint.partitions_state = PartitionsState::Idle;
        self.checkpoint.version_in_progress = None;
        self.checkpoint.config_version_in_progress = None;
        self.store.save(&self.checkpoint)?;
        self.store.clear_slots()?;

        if let Some(handle) = self.handle.take() {
            self.release(handle);
        }

        self.set_phase(DfuPhase::Erasing);
        match self.driver.begin_erase() {
            Ok(EraseStatus::Complete) => Ok(Start::Ready(self.on_erase_complete(true)?)),
            Ok(EraseStatus::Pending) => {
                debug!("Erase pending");
                self.erase_pending = true;
                Ok(Start::WaitForErase)
            }
            Err(e) => {
                error!(error = %e, "Failed to start erase");
                Err(self.fail(DfuError::EraseFailed))
            }
        }
    }

    /// Poll a pending erase. Returns the first request once it finished.
    pub fn poll_erase(&mut self) -> Result<Option<DataRequest>, DfuError> {
        if !self.erase_pending {
            return Err(DfuError::InvalidState);
        }
        match self.driver.erase_status() {
            None => Ok(None),
            Some(ok) => self.on_erase_complete(ok).map(Some),
        }
    }

    /// Erase finished; unblocks the dispatcher.
    pub fn on_erase_complete(&mut self, ok: bool) -> Result<DataRequest, DfuError> {
        self.erase_pending = false;
        if !ok {
            return Err(self.fail(DfuError::EraseFailed));
        }
        self.checkpoint.partitions_state = PartitionsState::Erased;
        self.store.save(&self.checkpoint)?;
        info!("Inactive bank erased");
        self.set_phase(DfuPhase::Transfer);
        Ok(self.state.request_next_section(0))
    }

    /// Re-enter the dispatcher after the link dropped, without a reboot.
    /// An open partition handle is kept and reused.
    pub fn restart_transfer(&mut self) -> Result<DataRequest, DfuError> {
        if self.erase_pending {
            return Err(DfuError::ErasePending);
        }
        self.failed = false;
        self.state = SessionState::new(self.config.signing_mode);
        self.state.open_next_partition = self.handle.is_none();
        self.resume_request()
    }

    /// First request of a resumed transfer.
    fn resume_request(&mut self) -> Result<DataRequest, DfuError> {
        let last_closed = self.checkpoint.last_closed_partition;
        let mut request = None;

        if self.config.store_headers {
            let mirror = read_mirror(&self.store)?;
            if let Some(position) = replay_headers(&mirror, last_closed) {
                self.state.header_seen = true;
                self.state.signing_mode = position.signing_mode;
                self.state.mirror = HeaderMirror::at(position.mirror_cursor);
                self.state.image_partitions = position.completed;
                self.observer.on_event(&DfuEvent::Resumed {
                    file_offset: position.file_offset,
                    last_closed_partition: last_closed,
                });
                request = Some(self.state.request_next_section(position.file_offset));
            } else {
                warn!("No usable header mirror, resuming from image start");
            }
        }

        let request = match request {
            Some(request) => request,
            None => {
                self.observer.on_event(&DfuEvent::Resumed {
                    file_offset: 0,
                    last_closed_partition: last_closed,
                });
                self.state.request_next_section(0)
            }
        };
        self.set_phase(DfuPhase::Transfer);
        Ok(request)
    }

    /// Feed bytes answering the outstanding request.
    pub fn handle_data(
        &mut self,
        data: &[u8],
        request_complete: bool,
    ) -> Result<HandleResult, DfuError> {
        if self.erase_pending {
            return Err(DfuError::ErasePending);
        }
        if self.failed {
            return Err(DfuError::InvalidState);
        }

        let mut ctx = HandlerContext {
            driver: &self.driver,
            store: &self.store,
            verifier: &self.verifier,
            observer: self.observer.as_ref(),
            config: &self.config,
            state: &mut self.state,
            checkpoint: &mut self.checkpoint,
            handle: &mut self.handle,
        };

        match dispatch(data, request_complete, &mut ctx) {
            Ok(HandleResult::TransferComplete) => {
                self.set_phase(DfuPhase::Complete);
                Ok(HandleResult::TransferComplete)
            }
            Ok(result) => Ok(result),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Feed one transport delivery, checking the image ends where the footer does.
    pub fn handle_delivery(&mut self, delivery: &Delivery) -> Result<HandleResult, DfuError> {
        let result = self.handle_data(&delivery.data, delivery.request_complete)?;
        match result {
            HandleResult::TransferComplete if !delivery.last_packet => {
                Err(self.fail(DfuError::FileTooBig))
            }
            HandleResult::TransferComplete => Ok(result),
            _ if delivery.last_packet => Err(self.fail(DfuError::FileTooSmall)),
            _ => Ok(result),
        }
    }

    /// Stop the session. Any open partition is closed best-effort; the
    /// checkpoint survives for a later resume.
    pub fn abort(&mut self) {
        info!(state = %self.state.state, "Aborting upgrade session");
        if let Some(handle) = self.handle.take() {
            self.release(handle);
        }
        self.erase_pending = false;
        self.state = SessionState::new(self.config.signing_mode);
        self.set_phase(DfuPhase::Idle);
    }

    /// Abort and forget the upgrade entirely.
    pub fn abandon(&mut self) -> Result<(), DfuError> {
        self.abort();
        self.store.clear()?;
        self.checkpoint = PersistedCheckpoint::default();
        info!("Upgrade abandoned, checkpoint cleared");
        Ok(())
    }

    fn release(&self, handle: PartitionHandle) {
        let partition = handle.partition();
        if let Err(e) = self.driver.close(handle) {
            warn!(partition, error = %e, "Failed to close partition");
        }
    }

    /// Record a fatal error and tear the session down.
    fn fail(&mut self, error: DfuError) -> DfuError {
        error!(code = %format!("0x{:02X}", error.code()), class = %error.class(), "{}", error);
        self.observer.on_event(&DfuEvent::Error {
            code: error.code(),
            message: error.to_string(),
        });

        if matches!(error, DfuError::FileTooBig)
            && self.checkpoint.resume_point == ResumePoint::Verified
        {
            self.checkpoint.resume_point = ResumePoint::Error;
            if let Err(e) = self.store.save(&self.checkpoint) {
                warn!(error = %e, "Failed to record oversized image");
            }
        }

        if let Some(handle) = self.handle.take() {
            self.release(handle);
        }
        self.failed = true;
        self.set_phase(DfuPhase::Error);
        error
    }
}

impl<D, S, V, O> Drop for UpgradeSession<D, S, V, O>
where
    D: PartitionDriver,
    S: CheckpointStore,
    V: ImageVerifier,
    O: DfuObserver,
{
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.release(handle);
        }
    }
}
