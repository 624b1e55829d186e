use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Local IPC primitive a daemon listens on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum TransportKind {
    /// Length-prefixed frames on a duplex byte stream. A named pipe on
    /// Windows and a Unix domain socket elsewhere.
    Pipe,
    /// HTTP/1.1 over a Unix domain socket.
    Socket,
}

impl TransportKind {
    /// Transport used when nothing overrides the selection.
    #[must_use]
    pub const fn platform_default() -> Self {
        if cfg!(windows) {
            Self::Pipe
        } else {
            Self::Socket
        }
    }
}

/// Contents of a connection file.
///
/// Written once by the daemon that owns it and read by every later client
/// invocation that needs to reach that daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Transport the daemon listens on.
    pub transport: TransportKind,
    /// Pipe name or socket path.
    pub address: String,
    /// Process id of the daemon.
    pub pid: u32,
    /// Seconds since the Unix epoch when the daemon published the file.
    #[serde(default)]
    pub created_at: u64,
}

impl ConnectionInfo {
    /// Builds connection details for a daemon.
    pub fn new(transport: TransportKind, address: impl Into<String>, pid: u32, created_at: u64) -> Self {
        Self {
            transport,
            address: address.into(),
            pid,
            created_at,
        }
    }
}
