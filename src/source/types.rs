//! Types crossing the remote-store boundary.

use crate::types::ChangeEvent;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One item on a change stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceMessage {
    /// A committed remote mutation.
    Event { event: ChangeEvent },

    /// The stream ended. No further messages follow.
    Closed { reason: CloseReason },
}

impl From<ChangeEvent> for SourceMessage {
    fn from(event: ChangeEvent) -> Self {
        SourceMessage::Event { event }
    }
}

/// Why a change stream was closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Remote side went away.
    Disconnected,
    /// Remote side reported an error.
    Error(String),
    /// Explicitly unsubscribed.
    Unsubscribed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::BufferOverflow => f.write_str("buffer overflow"),
            CloseReason::Disconnected => f.write_str("disconnected"),
            CloseReason::Error(msg) => write!(f, "error: {}", msg),
            CloseReason::Unsubscribed => f.write_str("unsubscribed"),
        }
    }
}

/// Unique identifier for a stream subscription at a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Cancels a subscription when invoked or dropped.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Unsubscribe(Some(Box::new(f)))
    }

    /// An unsubscribe hook that does nothing.
    pub fn noop() -> Self {
        Unsubscribe(None)
    }

    /// Cancel now.
    pub fn cancel(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Unsubscribe")
            .field(&if self.0.is_some() { "armed" } else { "spent" })
            .finish()
    }
}

/// A live change stream returned by a source.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: Receiver<SourceMessage>,
    unsubscribe: Unsubscribe,
}

impl EventSubscription {
    pub fn new(receiver: Receiver<SourceMessage>, unsubscribe: Unsubscribe) -> Self {
        Self {
            receiver,
            unsubscribe,
        }
    }

    pub fn receiver(&self) -> &Receiver<SourceMessage> {
        &self.receiver
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<SourceMessage, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Split into the stream and its cancel hook.
    pub fn into_parts(self) -> (Receiver<SourceMessage>, Unsubscribe) {
        (self.receiver, self.unsubscribe)
    }
}
