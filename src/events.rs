//! # Pipeline Events
//!
//! Everything a caller may want to react to is pushed onto one channel: state
//! transitions from the connection supervisor and outcomes from the writer
//! thread. Tests assert on this stream instead of peeking at internal state.

use crate::connection::ConnectionState;
use crate::error::DecodeError;
use crossbeam_channel::Sender;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    DeviceFound {
        name: String,
        address: String,
    },
    /// Frame dropped; monitoring continues
    DecodeFailed(DecodeError),
    /// Frame arrived while no buffer was accepting samples
    FrameRejected,
    BatchPersisted {
        count: usize,
    },
    /// First failure of a batch; the unwritten samples stay queued for retry
    PersistenceFailed {
        samples: usize,
        error: String,
    },
    /// Samples given up on for good
    BatchDropped {
        samples: usize,
        reason: String,
    },
    /// A best-effort teardown step failed and was skipped
    TeardownFailed {
        step: TeardownStep,
        reason: String,
    },
    /// Notification stream ended without a stop request
    LinkLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Unsubscribe,
    Disconnect,
}

/// Sending half of the event channel. A dropped receiver is not an error.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: Sender<PipelineEvent>,
}

impl EventSender {
    pub fn new(sender: Sender<PipelineEvent>) -> Self {
        Self { sender }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if self.sender.send(event).is_err() {
            log::trace!("Event receiver dropped");
        }
    }
}
