//! State machine implementation for the update sequence.

use std::fmt;
use std::ops::Range;

use thiserror::Error;

/// Protocol state of an update. Transitions only ever move one step
/// forward; a failed session is restarted from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum UpdatePhase {
    #[default]
    Idle,
    Started,
    Initialized,
    Transferring,
    Validated,
    Activated,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Idle => write!(f, "IDLE"),
            UpdatePhase::Started => write!(f, "STARTED"),
            UpdatePhase::Initialized => write!(f, "INITIALIZED"),
            UpdatePhase::Transferring => write!(f, "TRANSFERRING"),
            UpdatePhase::Validated => write!(f, "VALIDATED"),
            UpdatePhase::Activated => write!(f, "ACTIVATED"),
        }
    }
}

impl UpdatePhase {
    /// The only phase reachable from this one.
    pub fn next(self) -> Option<Self> {
        match self {
            UpdatePhase::Idle => Some(UpdatePhase::Started),
            UpdatePhase::Started => Some(UpdatePhase::Initialized),
            UpdatePhase::Initialized => Some(UpdatePhase::Transferring),
            UpdatePhase::Transferring => Some(UpdatePhase::Validated),
            UpdatePhase::Validated => Some(UpdatePhase::Activated),
            UpdatePhase::Activated => None,
        }
    }

    /// Progress line for entering this phase.
    pub fn description(self) -> &'static str {
        match self {
            UpdatePhase::Idle => "Idle",
            UpdatePhase::Started => "DFU started",
            UpdatePhase::Initialized => "DFU initialized",
            UpdatePhase::Transferring => "Uploading image",
            UpdatePhase::Validated => "Image validated",
            UpdatePhase::Activated => "Image activated",
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: UpdatePhase,
    pub to: UpdatePhase,
}

/// Image transfer bookkeeping.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Total bytes to send.
    pub total: usize,
    /// Bytes acknowledged so far.
    pub offset: usize,
    chunk_size: usize,
    interval: usize,
    next_notify: usize,
}

impl TransferProgress {
    pub fn new(total: usize, chunk_size: usize, interval: usize) -> Self {
        let interval = interval.max(1);
        Self {
            total,
            offset: 0,
            chunk_size: chunk_size.max(1),
            interval,
            next_notify: interval,
        }
    }

    /// Byte range of the next chunk, if any remain.
    pub fn next_chunk(&self) -> Option<Range<usize>> {
        if self.is_done() {
            return None;
        }
        Some(self.offset..self.total.min(self.offset + self.chunk_size))
    }

    /// Whether `chunk` ends the transfer.
    pub fn is_last_chunk(&self, chunk: &Range<usize>) -> bool {
        chunk.end == self.total
    }

    /// Record `len` more acknowledged bytes. Returns true when progress
    /// should be reported.
    pub fn advance(&mut self, len: usize) -> bool {
        self.offset += len;
        if self.offset >= self.next_notify || self.is_done() {
            self.next_notify += self.interval;
            return true;
        }
        false
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.total
    }
}

/// State machine context holding all runtime state.
#[derive(Debug, Default)]
pub struct StateMachineContext {
    /// Current protocol phase.
    pub phase: UpdatePhase,
}

impl StateMachineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `to`, which must be the next phase.
    pub fn goto_state(&mut self, to: UpdatePhase) -> Result<(), InvalidTransition> {
        if self.phase.next() != Some(to) {
            return Err(InvalidTransition {
                from: self.phase,
                to,
            });
        }
        tracing::info!(from = %self.phase, to = %to, "State transition");
        self.phase = to;
        Ok(())
    }

    /// Drop back to `Idle` for a fresh attempt.
    pub fn reset(&mut self) {
        self.phase = UpdatePhase::Idle;
    }

    pub fn is_complete(&self) -> bool {
        self.phase == UpdatePhase::Activated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_transitions() {
        let mut ctx = StateMachineContext::new();
        let mut phase = UpdatePhase::Idle;
        while let Some(next) = phase.next() {
            ctx.goto_state(next).unwrap();
            phase = next;
        }
        assert!(ctx.is_complete());
        assert_eq!(ctx.phase, UpdatePhase::Activated);
    }

    #[test]
    fn test_no_skipping_or_backtracking() {
        let mut ctx = StateMachineContext::new();
        assert_eq!(
            ctx.goto_state(UpdatePhase::Initialized),
            Err(InvalidTransition {
                from: UpdatePhase::Idle,
                to: UpdatePhase::Initialized
            })
        );
        ctx.goto_state(UpdatePhase::Started).unwrap();
        assert!(ctx.goto_state(UpdatePhase::Started).is_err());
        assert!(ctx.goto_state(UpdatePhase::Idle).is_err());

        ctx.reset();
        assert_eq!(ctx.phase, UpdatePhase::Idle);
    }

    #[test]
    fn test_transfer_chunks() {
        let mut progress = TransferProgress::new(400, 192, 2048);
        let mut chunks = Vec::new();
        while let Some(chunk) = progress.next_chunk() {
            chunks.push((chunk.clone(), progress.is_last_chunk(&chunk)));
            progress.advance(chunk.len());
        }
        assert_eq!(
            chunks,
            vec![(0..192, false), (192..384, false), (384..400, true)]
        );
        assert!(progress.is_done());
    }

    #[test]
    fn test_transfer_progress_interval() {
        let mut progress = TransferProgress::new(5000, 192, 2048);
        let mut reported = Vec::new();
        while let Some(chunk) = progress.next_chunk() {
            if progress.advance(chunk.len()) {
                reported.push(progress.offset);
            }
        }
        assert_eq!(reported, vec![2112, 4224, 5000]);
    }

    #[test]
    fn test_empty_transfer() {
        let progress = TransferProgress::new(0, 192, 2048);
        assert!(progress.next_chunk().is_none());
    }
}
