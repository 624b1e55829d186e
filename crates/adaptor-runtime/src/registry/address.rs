//! Collision-free daemon addresses.
//!
//! Every daemon listens on `<base>-<pid>` where the base is derived from the
//! adaptor name and the connection file path. When that address is taken the
//! allocator tries `<base>-<pid>-1`, `<base>-<pid>-2` and so on, up to
//! [`MAX_ADDRESS_ATTEMPTS`] candidates.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{REGISTRY_TARGET, RegistryError};
use crate::transport::{AddressNamespace, ServerHandle, Transport, TransportError};

/// Upper bound on candidate addresses tried before giving up.
pub const MAX_ADDRESS_ATTEMPTS: usize = 8;

const MAX_NAME_CHARS: usize = 32;
const HASH_BYTES: usize = 4;

#[cfg(target_os = "macos")]
const MAX_SOCKET_PATH: usize = 103;
#[cfg(not(target_os = "macos"))]
const MAX_SOCKET_PATH: usize = 107;

/// Derives the deterministic part of a daemon address.
#[must_use]
pub fn base_name(adaptor: &str, connection_file: &Path) -> String {
    let mut name: String = adaptor
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(MAX_NAME_CHARS)
        .collect();
    if name.is_empty() {
        name.push_str("adaptor");
    }
    let absolute = std::path::absolute(connection_file).unwrap_or_else(|_| connection_file.to_path_buf());
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    let suffix: String = digest
        .iter()
        .take(HASH_BYTES)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    format!("{name}-{suffix}")
}

fn candidate(base: &str, pid: u32, attempt: usize) -> String {
    if attempt == 0 {
        format!("{base}-{pid}")
    } else {
        format!("{base}-{pid}-{attempt}")
    }
}

/// Directories eligible to hold socket files, in order of preference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketDirectories {
    candidates: Vec<PathBuf>,
}

impl SocketDirectories {
    /// Uses exactly the given directories.
    #[must_use]
    pub const fn new(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    /// Resolves and prepares the socket directories.
    ///
    /// An explicit `configured` directory is used alone. Otherwise the
    /// per-user directory under the home directory comes first, then a
    /// per-uid directory under the system temp directory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SocketDirectory`] when no directory can be
    /// prepared.
    pub fn resolve(configured: Option<&Path>) -> Result<Self, RegistryError> {
        if let Some(dir) = configured {
            create_private_dir(dir)?;
            return Ok(Self::new(vec![dir.to_path_buf()]));
        }
        let mut candidates = Vec::new();
        let mut last_error = None;
        if let Some(home) = dirs::home_dir() {
            let dir = home.join(".openjd").join("adaptors").join("sockets");
            match create_private_dir(&dir) {
                Ok(()) => candidates.push(dir),
                Err(error) => {
                    debug!(target: REGISTRY_TARGET, %error, "home socket directory unavailable");
                    last_error = Some(error);
                }
            }
        }
        match temp_socket_dir().and_then(|dir| create_private_dir(&dir).map(|()| dir)) {
            Ok(dir) => candidates.push(dir),
            Err(error) => {
                debug!(target: REGISTRY_TARGET, %error, "temp socket directory unavailable");
                last_error = Some(error);
            }
        }
        match (candidates.is_empty(), last_error) {
            (true, Some(error)) => Err(error),
            _ => Ok(Self::new(candidates)),
        }
    }

    /// Candidate directories.
    #[must_use]
    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Path for a socket called `name` in the first candidate directory
    /// where it fits in a socket address.
    #[must_use]
    pub fn place(&self, name: &str) -> Option<PathBuf> {
        self.candidates
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| path.as_os_str().len() <= MAX_SOCKET_PATH)
    }
}

fn temp_socket_dir() -> Result<PathBuf, RegistryError> {
    let tmp = env::temp_dir();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(&tmp).map_err(|source| RegistryError::SocketDirectory {
            path: tmp.clone(),
            source,
        })?;
        if metadata.permissions().mode() & 0o1000 == 0 {
            return Err(RegistryError::SocketDirectory {
                path: tmp,
                source: io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "temp directory does not have the sticky bit set",
                ),
            });
        }
        let uid = nix::unistd::geteuid().as_raw();
        Ok(tmp
            .join(".openjd")
            .join("adaptors")
            .join("sockets")
            .join(uid.to_string()))
    }
    #[cfg(not(unix))]
    {
        Ok(tmp.join(".openjd").join("adaptors").join("sockets"))
    }
}

fn create_private_dir(dir: &Path) -> Result<(), RegistryError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(|source| RegistryError::SocketDirectory {
            path: dir.to_path_buf(),
            source,
        })
}

/// Binds the first free candidate address for one daemon.
pub struct AddressAllocator {
    transport: Arc<dyn Transport>,
    directories: SocketDirectories,
    pid: u32,
}

impl AddressAllocator {
    /// Creates an allocator for the daemon with process id `pid`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, directories: SocketDirectories, pid: u32) -> Self {
        Self {
            transport,
            directories,
            pid,
        }
    }

    /// Listens on the first free candidate derived from `base`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AddressAllocationExhausted`] when every
    /// candidate is taken or too long for the platform, and
    /// [`RegistryError::Listen`] for any other listen failure.
    pub fn bind(&self, base: &str) -> Result<Box<dyn ServerHandle>, RegistryError> {
        for attempt in 0..MAX_ADDRESS_ATTEMPTS {
            let name = candidate(base, self.pid, attempt);
            let address = match self.transport.namespace() {
                AddressNamespace::Named => name,
                AddressNamespace::Filesystem => match self.directories.place(&name) {
                    Some(path) => path.display().to_string(),
                    None => {
                        debug!(target: REGISTRY_TARGET, %name, "no socket directory fits candidate");
                        continue;
                    }
                },
            };
            match self.transport.listen(&address) {
                Ok(server) => {
                    info!(target: REGISTRY_TARGET, %address, attempt, "bound daemon address");
                    return Ok(server);
                }
                Err(TransportError::AddressInUse { .. }) => {
                    debug!(target: REGISTRY_TARGET, %address, "address in use, trying next candidate");
                }
                Err(source) => return Err(RegistryError::Listen { address, source }),
            }
        }
        Err(RegistryError::AddressAllocationExhausted {
            base: base.to_owned(),
            attempts: MAX_ADDRESS_ATTEMPTS,
        })
    }
}
