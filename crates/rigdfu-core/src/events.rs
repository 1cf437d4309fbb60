//! Event system for UI decoupling.
//!
//! The session reports progress through a [`DfuObserver`] handed to it by
//! the caller instead of printing or consulting a global verbosity level.

use std::fmt;

use crate::protocol::{OpCode, OpStatus};
use crate::state::UpdatePhase;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Coarse session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuPhase {
    /// Waking the serial loader.
    LinkActivation,
    /// Running the Start..Activate sequence.
    Update,
    /// Sending a config packet.
    Configure,
    /// Waiting for the device to reset after activation.
    Settling,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for DfuPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuPhase::LinkActivation => write!(f, "Link Activation"),
            DfuPhase::Update => write!(f, "Update"),
            DfuPhase::Configure => write!(f, "Configure"),
            DfuPhase::Settling => write!(f, "Settling"),
            DfuPhase::Complete => write!(f, "Complete"),
            DfuPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by an update session.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// Wake pattern sent.
    WakeAttempt { attempt: u32, max: u32 },
    /// Loader answered with its banner.
    LinkReady { banner: String },
    /// Session phase changed.
    PhaseChanged { from: DfuPhase, to: DfuPhase },
    /// Protocol state advanced.
    StateChanged { from: UpdatePhase, to: UpdatePhase },
    /// Image bytes acknowledged so far.
    Progress { current: u64, total: u64 },
    /// Request frame sent.
    RequestSent { op: OpCode, length: usize },
    /// Response accepted.
    ResponseReceived { op: OpCode, status: OpStatus },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred.
    Error { message: String },
    /// All operations completed successfully.
    Complete,
}

/// Observer trait for receiving session events.
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
            DfuEvent::WakeAttempt { attempt, max } => {
                if *attempt > 1 {
                    tracing::info!(attempt, max, "No response from loader, retrying");
                } else {
                    tracing::info!("Activating serial loader");
                }
            }
            DfuEvent::LinkReady { banner } => {
                tracing::info!(banner = %banner, "Loader ready");
            }
            DfuEvent::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
            }
            DfuEvent::StateChanged { to, .. } => {
                tracing::info!("{}", to.description());
            }
            DfuEvent::Progress { current, total } => {
                tracing::info!("Transferred {}/{} bytes", current, total);
            }
            DfuEvent::RequestSent { op, length } => {
                tracing::trace!(op = %op, len = length, "Request sent");
            }
            DfuEvent::ResponseReceived { op, status } => {
                tracing::debug!(op = %op, status = %status, "Response OK");
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            DfuEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every event for later inspection.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<DfuEvent>>,
    }

    impl DfuObserver for RecordingObserver {
        fn on_event(&self, event: &DfuEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
