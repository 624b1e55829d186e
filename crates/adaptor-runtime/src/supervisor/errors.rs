//! Error types for starting, driving and reaping daemons.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use adaptor_protocol::exit_codes;
use thiserror::Error;

use crate::registry::RegistryError;
use crate::transport::TransportError;

/// Failures managing daemon processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The daemon executable could not be launched.
    #[error("failed to launch daemon {program}: {source}")]
    Spawn {
        /// Executable that was launched.
        program: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The bootstrap log could not be created.
    #[error("failed to prepare daemon log {path}: {source}")]
    LogFile {
        /// Log file path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The daemon never reported READY.
    #[error("daemon did not become ready within {}ms", timeout.as_millis())]
    StartupTimeout {
        /// How long the supervisor waited.
        timeout: Duration,
    },
    /// The daemon process exited before becoming ready.
    #[error("daemon exited during startup ({exit_status})")]
    StartupFailed {
        /// Rendered exit status.
        exit_status: String,
    },
    /// The adaptor's start callback failed.
    #[error("daemon failed to start: {message}")]
    StartupCanceled {
        /// Error reported by the daemon.
        message: String,
    },
    /// The child process could not be polled.
    #[error("failed to monitor daemon process: {source}")]
    MonitorChild {
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The daemon outlived the reap timeout.
    #[error("daemon {pid} did not exit within {}ms and was killed", timeout.as_millis())]
    UngracefulExit {
        /// The daemon process.
        pid: u32,
        /// How long it was given.
        timeout: Duration,
    },
    /// Signal handlers could not be installed.
    #[error("failed to install signal handlers: {source}")]
    Signal {
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// Another daemon already serves the connection file.
    #[error(
        "a daemon{} is already running for {path}",
        .pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
    )]
    AlreadyRunning {
        /// The running daemon, when known.
        pid: Option<u32>,
        /// The contested connection file.
        path: PathBuf,
    },
    /// The path of the running executable is unknown.
    #[error("failed to locate the current executable: {source}")]
    CurrentExe {
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::StartupTimeout { .. } => exit_codes::TIMEOUT,
            Self::AlreadyRunning { .. } => exit_codes::ADDRESS_UNAVAILABLE,
            Self::Spawn { .. }
            | Self::LogFile { .. }
            | Self::StartupFailed { .. }
            | Self::StartupCanceled { .. }
            | Self::MonitorChild { .. }
            | Self::UngracefulExit { .. }
            | Self::Signal { .. }
            | Self::CurrentExe { .. } => exit_codes::STARTUP_FAILED,
        }
    }
}

/// Failures of client-side daemon commands.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Talking to the daemon failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The connection file was unusable.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Managing the daemon process failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Daemon output could not be written to the console.
    #[error("failed to forward daemon output: {source}")]
    Forward {
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Transport(error) => transport_exit_code(error),
            Self::Registry(error) => registry_exit_code(error),
            Self::Process(error) => error.exit_code(),
            Self::Forward { .. } => exit_codes::PROTOCOL,
        }
    }
}

const fn transport_exit_code(error: &TransportError) -> u8 {
    match error {
        TransportError::ConnectionRefused { .. } => exit_codes::CONNECTION_REFUSED,
        TransportError::AddressInUse { .. } => exit_codes::ADDRESS_UNAVAILABLE,
        TransportError::Busy { .. } | TransportError::Timeout { .. } => exit_codes::TIMEOUT,
        TransportError::Unsupported { .. } => exit_codes::USAGE,
        TransportError::Framing { .. }
        | TransportError::Encode { .. }
        | TransportError::Closed
        | TransportError::Io { .. } => exit_codes::PROTOCOL,
    }
}

const fn registry_exit_code(error: &RegistryError) -> u8 {
    match error {
        RegistryError::ConnectionFileNotFound { .. } | RegistryError::ConnectionFileRead { .. } => {
            exit_codes::CONNECTION_FILE_NOT_FOUND
        }
        RegistryError::ConnectionFileCorrupt { .. } => exit_codes::CONNECTION_FILE_CORRUPT,
        RegistryError::AddressAllocationExhausted { .. }
        | RegistryError::Listen { .. }
        | RegistryError::AlreadyRunning { .. } => exit_codes::ADDRESS_UNAVAILABLE,
        RegistryError::ConnectionFileWrite { .. }
        | RegistryError::Encode { .. }
        | RegistryError::SocketDirectory { .. }
        | RegistryError::Lock { .. } => exit_codes::STARTUP_FAILED,
    }
}
