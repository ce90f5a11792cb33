//! Error types for the long-poll registry.

use thiserror::Error;

/// Long-poll registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LongpollError {
    /// No live receiver is registered under the key.
    ///
    /// Either the receiver never registered or its lease expired and the
    /// purge loop reclaimed it. Hosts should answer with a fresh
    /// subscription rather than a hard failure.
    #[error("Receiver not found")]
    ReceiverNotFound,
}

impl LongpollError {
    /// Check if this error means the receiver is unknown to the registry.
    pub fn is_receiver_not_found(&self) -> bool {
        matches!(self, Self::ReceiverNotFound)
    }
}
