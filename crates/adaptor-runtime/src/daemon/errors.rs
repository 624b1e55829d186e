//! Failures that end a daemon process.

use std::io;

use adaptor_protocol::exit_codes;
use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::registry::RegistryError;
use crate::supervisor::ProcessError;
use crate::telemetry::TelemetryError;
use crate::transport::TransportError;

/// Errors raised while bringing a daemon up or serving.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Starting a new session failed.
    #[error("failed to detach from the controlling terminal: {source}")]
    Detach {
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// Diagnostic logging could not be set up.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// The lock, address or connection file could not be claimed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The transport is unavailable.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Signal handlers could not be installed.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Serving stopped because accepting kept failing.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl DaemonError {
    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Registry(
                RegistryError::AlreadyRunning { .. }
                | RegistryError::AddressAllocationExhausted { .. }
                | RegistryError::Listen { .. },
            ) => exit_codes::ADDRESS_UNAVAILABLE,
            _ => exit_codes::STARTUP_FAILED,
        }
    }
}
