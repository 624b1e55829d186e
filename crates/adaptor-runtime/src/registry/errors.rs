//! Error types for connection files, address allocation and daemon locks.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors raised by the connection registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No connection file exists at the path.
    #[error("connection file {path} does not exist")]
    ConnectionFileNotFound {
        /// The missing file.
        path: PathBuf,
    },
    /// The connection file is not valid JSON connection details.
    #[error("connection file {path} is corrupt: {source}")]
    ConnectionFileCorrupt {
        /// The unreadable file.
        path: PathBuf,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// The connection file exists but could not be read.
    #[error("failed to read connection file {path}: {source}")]
    ConnectionFileRead {
        /// The file being read.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The connection file could not be written.
    #[error("failed to write connection file {path}: {source}")]
    ConnectionFileWrite {
        /// The file being written.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// Connection details could not be serialised.
    #[error("failed to encode connection details: {source}")]
    Encode {
        /// Encoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// Every candidate address was taken.
    #[error("no free address for {base} after {attempts} attempts")]
    AddressAllocationExhausted {
        /// Name the candidates were derived from.
        base: String,
        /// How many candidates were tried.
        attempts: usize,
    },
    /// Binding an address failed for a reason other than it being taken.
    #[error("failed to listen on {address}: {source}")]
    Listen {
        /// The address being bound.
        address: String,
        /// Transport failure.
        #[source]
        source: TransportError,
    },
    /// No usable directory for socket files.
    #[error("failed to prepare socket directory {path}: {source}")]
    SocketDirectory {
        /// The directory that was rejected.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// Another daemon holds the connection file's lock.
    #[error(
        "a daemon{} already owns {path}",
        .pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
    )]
    AlreadyRunning {
        /// Pid recorded by the holder, when it could be read.
        pid: Option<u32>,
        /// The contested connection file.
        path: PathBuf,
    },
    /// The lock file could not be created, locked or written.
    #[error("failed to manage lock file {path}: {source}")]
    Lock {
        /// The lock file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
}
