//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to follow an upgrade without
//! tight coupling to the engine.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Upgrade session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuPhase {
    /// Nothing started yet.
    Idle,
    /// Inactive bank erase in progress.
    Erasing,
    /// Image sections are streaming in.
    Transfer,
    /// Footer received, signature being checked.
    Verifying,
    /// Image fully received and verified.
    Complete,
    /// Session failed.
    Error,
}

impl fmt::Display for DfuPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuPhase::Idle => write!(f, "Idle"),
            DfuPhase::Erasing => write!(f, "Erasing"),
            DfuPhase::Transfer => write!(f, "Transfer"),
            DfuPhase::Verifying => write!(f, "Verifying"),
            DfuPhase::Complete => write!(f, "Complete"),
            DfuPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by the upgrade engine.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// Phase changed.
    PhaseChanged { from: DfuPhase, to: DfuPhase },
    /// Upgrade header accepted.
    HeaderAccepted {
        variant: String,
        version: String,
        signing_mode: String,
    },
    /// Transfer resumed from a checkpoint.
    Resumed {
        file_offset: u32,
        last_closed_partition: u16,
    },
    /// Progress through the current partition.
    Progress {
        partition: u16,
        current: u64,
        total: u64,
    },
    /// Partition written and closed.
    PartitionClosed { partition: u16 },
    /// Partition already on flash, skipped.
    PartitionSkipped { partition: u16 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred.
    Error { code: u16, message: String },
    /// Image fully received and verified.
    Complete,
}

/// Observer trait for receiving upgrade events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            DfuEvent::HeaderAccepted {
                variant,
                version,
                signing_mode,
            } => {
                tracing::info!(variant = %variant, version = %version, signing = %signing_mode, "Upgrade header accepted");
            }
            DfuEvent::Resumed {
                file_offset,
                last_closed_partition,
            } => {
                tracing::info!(
                    offset = file_offset,
                    last_closed = last_closed_partition,
                    "Resuming transfer"
                );
            }
            DfuEvent::Progress {
                partition,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(partition = partition, progress = %format!("{}%", pct), "Progress");
            }
            DfuEvent::PartitionClosed { partition } => {
                tracing::info!(partition = partition, "Partition closed");
            }
            DfuEvent::PartitionSkipped { partition } => {
                tracing::info!(partition = partition, "Partition already written, skipping");
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::Error { code, message } => {
                tracing::error!(code = %format!("0x{:02X}", code), "Error: {}", message);
            }
            DfuEvent::Complete => {
                tracing::info!("Upgrade image complete");
            }
        }
    }
}

/// Observer that keeps every event, for tests and post-mortems.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<DfuEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DfuEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl DfuObserver for RecordingObserver {
    fn on_event(&self, event: &DfuEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
