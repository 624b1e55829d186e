//! Error types for transport operations.

use std::io;

use adaptor_protocol::TransportKind;
use thiserror::Error;

/// Errors surfaced while listening on, connecting to, or exchanging frames
/// over a daemon address.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A live server already listens at the address.
    #[error("address {address} is already in use")]
    AddressInUse {
        /// The contested address.
        address: String,
    },
    /// Nothing listens at the address.
    #[error("nothing is listening at {address}: {source}")]
    ConnectionRefused {
        /// The address dialled.
        address: String,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The server exists but is not accepting connections.
    #[error("daemon at {address} is busy")]
    Busy {
        /// The address dialled.
        address: String,
    },
    /// A bounded wait elapsed.
    #[error("timed out while {operation}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
    },
    /// The peer sent something that is not a valid frame, or the stream
    /// broke off inside one.
    #[error("malformed frame: {message}")]
    Framing {
        /// What was wrong.
        message: String,
    },
    /// A frame could not be serialised.
    #[error("failed to encode frame: {source}")]
    Encode {
        /// Encoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// The connection was already closed.
    #[error("connection is closed")]
    Closed,
    /// The transport does not exist on this platform.
    #[error("transport {kind} is not supported on this platform")]
    Unsupported {
        /// The requested transport.
        kind: TransportKind,
    },
    /// Any other I/O failure.
    #[error("failed while {operation}: {source}")]
    Io {
        /// What was being done.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// Classifies an I/O failure raised during `operation`.
    pub(crate) fn io(operation: &'static str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout { operation },
            _ => Self::Io { operation, source },
        }
    }

    pub(crate) fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Returns `true` when nothing was listening at the target address.
    #[must_use]
    pub const fn is_refused(&self) -> bool {
        matches!(self, Self::ConnectionRefused { .. })
    }
}
