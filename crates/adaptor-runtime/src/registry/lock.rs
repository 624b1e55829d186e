//! The lock that makes one daemon the only writer of a connection file.
//!
//! `<connection file>.lock` carries an exclusive advisory lock and the
//! holder's pid. The kernel drops the lock when its holder dies, so a lock
//! file left behind by a crashed daemon is simply locked again by the next
//! one, and two daemons racing over it cannot both win.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use adaptor_protocol::ConnectionInfo;
use fs2::FileExt;
use tracing::{debug, info};

use super::files::{invalidate, write_connection_file};
use super::{REGISTRY_TARGET, RegistryError};

const MAX_LOCK_ATTEMPTS: usize = 5;

/// Exclusive ownership of a connection file by one daemon.
///
/// Only the holder writes the connection file. Dropping the lock
/// invalidates the file, when it still names the holder, and then releases
/// the lock.
#[derive(Debug)]
pub struct DaemonLock {
    lock_path: PathBuf,
    connection_file: PathBuf,
    pid: u32,
    file: File,
}

impl DaemonLock {
    /// Takes the lock guarding `connection_file` on behalf of `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRunning`] while another process holds
    /// the lock and [`RegistryError::Lock`] when the lock file cannot be
    /// managed.
    pub fn acquire(connection_file: &Path, pid: u32) -> Result<Self, RegistryError> {
        let lock_path = lock_path_for(connection_file);
        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            let mut file = open_lock(&lock_path).map_err(|source| lock_error(&lock_path, source))?;
            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(error) if is_contended(&error) => {
                    let holder = read_holder(&mut file);
                    info!(
                        target: REGISTRY_TARGET,
                        holder,
                        file = %lock_path.display(),
                        "refusing to start: lock held by another daemon"
                    );
                    return Err(RegistryError::AlreadyRunning {
                        pid: holder,
                        path: connection_file.to_path_buf(),
                    });
                }
                Err(source) => return Err(lock_error(&lock_path, source)),
            }
            if !still_linked(&file, &lock_path).map_err(|source| lock_error(&lock_path, source))? {
                debug!(target: REGISTRY_TARGET, attempt, "lock file was replaced while locking");
                continue;
            }
            record_holder(&mut file, pid).map_err(|source| lock_error(&lock_path, source))?;
            info!(
                target: REGISTRY_TARGET,
                file = %lock_path.display(),
                pid,
                "acquired daemon lock"
            );
            return Ok(Self {
                lock_path,
                connection_file: connection_file.to_path_buf(),
                pid,
                file,
            });
        }
        Err(lock_error(
            &lock_path,
            io::Error::other("lock file kept being replaced"),
        ))
    }

    /// Writes the connection file for the lock holder.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ConnectionFileWrite`] when the file cannot be
    /// written.
    pub fn publish(&self, info: &ConnectionInfo) -> Result<(), RegistryError> {
        write_connection_file(&self.connection_file, info)
    }

    /// Path of the lock file.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        invalidate(&self.connection_file, Some(self.pid));
        // Removed while still locked; a contender that opened the old file
        // notices the unlink and retries on a fresh one.
        #[cfg(unix)]
        if let Err(error) = std::fs::remove_file(&self.lock_path) {
            if error.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    target: REGISTRY_TARGET,
                    file = %self.lock_path.display(),
                    %error,
                    "failed to remove lock file"
                );
            }
        }
        if let Err(error) = FileExt::unlock(&self.file) {
            debug!(target: REGISTRY_TARGET, %error, "lock released on close instead");
        }
    }
}

fn lock_path_for(connection_file: &Path) -> PathBuf {
    let mut name = OsString::from(connection_file.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn open_lock(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn read_holder(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

fn record_holder(file: &mut File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{pid}")?;
    file.sync_all()
}

/// Whether `file` is still the one reachable at `path`.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

#[cfg(not(unix))]
#[expect(clippy::unnecessary_wraps, reason = "mirrors the unix signature")]
fn still_linked(_file: &File, _path: &Path) -> io::Result<bool> {
    Ok(true)
}

fn lock_error(path: &Path, source: io::Error) -> RegistryError {
    RegistryError::Lock {
        path: path.to_path_buf(),
        source,
    }
}
