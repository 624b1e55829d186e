//! Unix domain socket plumbing shared by both transports.

use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, warn};

use super::{TRANSPORT_TARGET, TransportError};

const SOCKET_MODE: u32 = 0o600;

/// A listening socket file owned by this process.
///
/// The file is removed when the socket is dropped.
#[derive(Debug)]
pub(super) struct BoundSocket {
    listener: UnixListener,
    path: PathBuf,
    address: String,
}

impl BoundSocket {
    pub(super) fn bind(address: &str) -> Result<Self, TransportError> {
        let path = PathBuf::from(address);
        clear_stale_socket(&path, address)?;
        let listener = UnixListener::bind(&path).map_err(|source| match source.kind() {
            io::ErrorKind::AddrInUse => TransportError::AddressInUse {
                address: address.to_owned(),
            },
            _ => TransportError::io("binding socket", source),
        })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(|source| TransportError::io("restricting socket permissions", source))?;
        Ok(Self {
            listener,
            path,
            address: address.to_owned(),
        })
    }

    pub(super) fn address(&self) -> &str {
        &self.address
    }

    pub(super) fn accept(&self) -> Result<UnixStream, TransportError> {
        let (stream, _) = self
            .listener
            .accept()
            .map_err(|source| TransportError::io("accepting connection", source))?;
        Ok(stream)
    }

    /// Accepts a connection only if one is already queued.
    pub(super) fn try_accept(&self) -> Result<Option<UnixStream>, TransportError> {
        self.listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::io("polling for connections", source))?;
        let accepted = self.listener.accept();
        self.listener
            .set_nonblocking(false)
            .map_err(|source| TransportError::io("polling for connections", source))?;
        match accepted {
            Ok((stream, _)) => {
                stream
                    .set_nonblocking(false)
                    .map_err(|source| TransportError::io("accepting connection", source))?;
                Ok(Some(stream))
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(TransportError::io("accepting connection", error)),
        }
    }
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(target: TRANSPORT_TARGET, address = %self.address, "removed socket file"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => warn!(
                target: TRANSPORT_TARGET,
                address = %self.address,
                %error,
                "failed to remove socket file"
            ),
        }
    }
}

fn clear_stale_socket(path: &Path, address: &str) -> Result<(), TransportError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(TransportError::io("inspecting socket path", error)),
    };
    if !metadata.file_type().is_socket() {
        return Err(TransportError::AddressInUse {
            address: address.to_owned(),
        });
    }
    match UnixStream::connect(path) {
        Ok(_stream) => Err(TransportError::AddressInUse {
            address: address.to_owned(),
        }),
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            debug!(target: TRANSPORT_TARGET, address, "removing stale socket file");
            fs::remove_file(path).map_err(|source| TransportError::io("removing stale socket", source))
        }
        Err(error) => Err(TransportError::io("probing existing socket", error)),
    }
}

/// Connects to the socket at `address`.
pub(super) fn connect(address: &str, timeout: Duration) -> Result<UnixStream, TransportError> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)
        .map_err(|source| TransportError::io("creating socket", source))?;
    let target =
        SockAddr::unix(address).map_err(|source| TransportError::io("resolving socket path", source))?;
    match socket.connect_timeout(&target, timeout) {
        Ok(()) => Ok(UnixStream::from(OwnedFd::from(socket))),
        Err(source)
            if matches!(
                source.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            Err(TransportError::ConnectionRefused {
                address: address.to_owned(),
                source,
            })
        }
        Err(source) if source.kind() == io::ErrorKind::WouldBlock => Err(TransportError::Busy {
            address: address.to_owned(),
        }),
        Err(source) => Err(TransportError::io("connecting", source)),
    }
}
