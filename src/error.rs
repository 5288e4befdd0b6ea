//! Error types for the ARQ engine.
//!
//! The taxonomy is deliberately small and stable: every variant corresponds
//! to one recoverable boundary condition. Input errors discard the offending
//! datagram but leave engine state intact; send/recv callers may retry.

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, KcpError>;

/// Errors produced by the protocol engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KcpError {
    /// Send was called with an empty payload.
    #[error("payload is empty")]
    EmptyPayload,

    /// The payload would fragment into more pieces than the 8-bit fragment
    /// counter can express.
    #[error("message needs {fragments} fragments, limit is 255")]
    OversizedMessage { fragments: usize },

    /// No complete message is ready for delivery.
    #[error("no complete message ready")]
    NotReady,

    /// The destination buffer is smaller than the next message.
    #[error("destination buffer too small, need {needed} bytes")]
    BufferTooSmall { needed: usize },

    /// The datagram is shorter than one segment header.
    #[error("datagram shorter than segment header")]
    Truncated,

    /// The datagram belongs to a different conversation.
    #[error("conversation mismatch: expected {expected}, got {got}")]
    ConvMismatch { expected: u32, got: u32 },

    /// A segment declared more payload bytes than the datagram holds.
    #[error("segment length exceeds remaining datagram bytes")]
    LengthMismatch,

    /// A segment carried a command outside the recognized set.
    #[error("unrecognized command {0}")]
    UnknownCommand(u8),

    /// An MTU / reserved-bytes setting is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl KcpError {
    /// True for conditions that leave the engine usable; currently all of
    /// them. The one unrecoverable state, a dead link, is surfaced through
    /// [`crate::engine::KcpEngine::is_dead`] instead of an error value.
    pub fn is_recoverable(&self) -> bool {
        true
    }
}
