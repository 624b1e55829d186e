//! Connection file persistence.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use adaptor_protocol::ConnectionInfo;
use tempfile::Builder;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::{REGISTRY_TARGET, RegistryError};

/// Writes the provided bytes to the path using an atomic persist step.
///
/// Data is flushed and fsync'd before the temporary file is renamed into
/// place so readers never observe a partially written file.
pub(super) fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut builder = Builder::new();
    builder.prefix(
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("connection"),
    );
    #[cfg(unix)]
    {
        builder.permissions(fs::Permissions::from_mode(0o600));
    }

    let mut file = builder.tempfile_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

/// Publishes `info` at `path`, readable only by the owner.
///
/// # Errors
///
/// Returns [`RegistryError::ConnectionFileWrite`] when the file cannot be
/// written.
pub fn write_connection_file(path: &Path, info: &ConnectionInfo) -> Result<(), RegistryError> {
    let mut contents =
        serde_json::to_vec_pretty(info).map_err(|source| RegistryError::Encode { source })?;
    contents.push(b'\n');
    atomic_write(path, &contents).map_err(|source| RegistryError::ConnectionFileWrite {
        path: path.to_path_buf(),
        source,
    })?;
    info!(
        target: REGISTRY_TARGET,
        file = %path.display(),
        address = %info.address,
        pid = info.pid,
        "connection file written"
    );
    Ok(())
}

/// Reads the connection details at `path`.
///
/// # Errors
///
/// Returns [`RegistryError::ConnectionFileNotFound`] when nothing exists at
/// `path` and [`RegistryError::ConnectionFileCorrupt`] when it does not hold
/// valid connection details.
pub fn read_connection_file(path: &Path) -> Result<ConnectionInfo, RegistryError> {
    let contents = fs::read(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            RegistryError::ConnectionFileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            RegistryError::ConnectionFileRead {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    serde_json::from_slice(&contents).map_err(|source| RegistryError::ConnectionFileCorrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Removes the connection file at `path`.
///
/// With `expected_pid` set the file is only removed while it still names
/// that daemon, so a newer daemon's file survives. Unreadable files are
/// removed either way. Returns whether a file was removed.
pub fn invalidate(path: &Path, expected_pid: Option<u32>) -> bool {
    if let Some(pid) = expected_pid {
        match read_connection_file(path) {
            Ok(info) if info.pid != pid => {
                debug!(
                    target: REGISTRY_TARGET,
                    file = %path.display(),
                    owner = info.pid,
                    expected = pid,
                    "connection file belongs to another daemon"
                );
                return false;
            }
            Err(RegistryError::ConnectionFileNotFound { .. }) => return false,
            Ok(_) | Err(_) => {}
        }
    }
    match fs::remove_file(path) {
        Ok(()) => {
            info!(target: REGISTRY_TARGET, file = %path.display(), "connection file invalidated");
            true
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => false,
        Err(error) => {
            warn!(
                target: REGISTRY_TARGET,
                file = %path.display(),
                %error,
                "failed to remove connection file"
            );
            false
        }
    }
}
