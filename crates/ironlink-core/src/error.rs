//! Unified error type for the ironlink adapter.
//!
//! One enum covers the whole failure taxonomy of the adapter. Session-fatal
//! variants (handshake, ordering, oversize, transport) force the owning
//! session towards `Closing`; `DeadlineExceeded` is local to a single send
//! attempt and never touches session state.

use serde::{Deserialize, Serialize};

/// Unified error type for all ironlink operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum IronlinkError {
    /// Handshake failed: attestation/policy rejection or handshake timeout.
    #[error("Handshake failed: {message}")]
    HandshakeFailure {
        /// What went wrong during the handshake
        message: String,
    },

    /// Inbound frame sequence number was not exactly last-accepted + 1.
    #[error("Ordering fault: expected sequence {expected}, got {actual}")]
    OrderingFault {
        /// The sequence number the session expected next
        expected: u64,
        /// The sequence number the frame carried
        actual: u64,
    },

    /// Declared frame length exceeds the configured maximum.
    #[error("Oversize frame: declared {declared} bytes, cap is {cap}")]
    OversizeFrame {
        /// Declared payload length from the wire
        declared: usize,
        /// Configured maximum frame size
        cap: usize,
    },

    /// Frame bytes could not be parsed.
    #[error("Malformed frame: {message}")]
    MalformedFrame {
        /// Description of the parse failure
        message: String,
    },

    /// Underlying secure-channel I/O failure.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the I/O failure
        message: String,
    },

    /// A caller-supplied deadline expired before the operation completed.
    #[error("Deadline exceeded: {operation}")]
    DeadlineExceeded {
        /// The operation that timed out
        operation: String,
    },

    /// Operation against a closed session or a shut-down adapter.
    #[error("Closed: {message}")]
    Closed {
        /// Why the target is unavailable
        message: String,
    },

    /// Invalid configuration or endpoint URI.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the invalid configuration
        message: String,
    },

    /// Internal invariant violation.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error
        message: String,
    },
}

impl IronlinkError {
    /// Create a handshake failure error
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::HandshakeFailure {
            message: message.into(),
        }
    }

    /// Create an ordering fault error
    pub fn ordering(expected: u64, actual: u64) -> Self {
        Self::OrderingFault { expected, actual }
    }

    /// Create an oversize frame error
    pub fn oversize(declared: usize, cap: usize) -> Self {
        Self::OversizeFrame { declared, cap }
    }

    /// Create a malformed frame error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a deadline exceeded error
    pub fn deadline(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// Create a closed error
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is fatal to the session it occurred on.
    ///
    /// Fatal errors force the session to `Closing` and produce exactly one
    /// fault event. `DeadlineExceeded` is deliberately non-fatal: the send
    /// attempt failed but the session is still healthy.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailure { .. }
                | Self::OrderingFault { .. }
                | Self::OversizeFrame { .. }
                | Self::MalformedFrame { .. }
                | Self::Transport { .. }
        )
    }
}

impl From<std::io::Error> for IronlinkError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

/// Standard Result type for ironlink operations
pub type Result<T> = std::result::Result<T, IronlinkError>;
