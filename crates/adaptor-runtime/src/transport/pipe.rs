//! Named pipe endpoints for the pipe transport on Windows.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use interprocess::local_socket::prelude::*;
use interprocess::local_socket::{GenericNamespaced, Listener, ListenerOptions, Stream};
use tracing::debug;

use super::framed::{ByteStream, FramedConnection};
use super::{Connection, ServerHandle, TRANSPORT_TARGET, TransportError};

const CONNECT_RETRY: Duration = Duration::from_millis(50);

struct PipeStream(Stream);

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl ByteStream for PipeStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        // Named pipe streams block without a deadline; callers fall back to
        // the daemon's own liveness checks.
        debug!(target: TRANSPORT_TARGET, ?timeout, "named pipes ignore receive timeouts");
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }
}

struct PipeServer {
    listener: Listener,
    address: String,
}

impl ServerHandle for PipeServer {
    fn address(&self) -> &str {
        &self.address
    }

    fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        let stream = self
            .listener
            .accept()
            .map_err(|source| TransportError::io("accepting connection", source))?;
        Ok(Box::new(FramedConnection::new(PipeStream(stream))))
    }
}

pub(super) fn listen(address: &str) -> Result<Box<dyn ServerHandle>, TransportError> {
    let name = address
        .to_ns_name::<GenericNamespaced>()
        .map_err(|source| TransportError::io("naming pipe", source))?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_sync()
        .map_err(|source| match source.kind() {
            io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied => TransportError::AddressInUse {
                address: address.to_owned(),
            },
            _ => TransportError::io("creating pipe", source),
        })?;
    Ok(Box::new(PipeServer {
        listener,
        address: address.to_owned(),
    }))
}

pub(super) fn connect(address: &str, timeout: Duration) -> Result<Box<dyn Connection>, TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        let name = address
            .to_ns_name::<GenericNamespaced>()
            .map_err(|source| TransportError::io("naming pipe", source))?;
        match Stream::connect(name) {
            Ok(stream) => return Ok(Box::new(FramedConnection::new(PipeStream(stream)))),
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                return Err(TransportError::ConnectionRefused {
                    address: address.to_owned(),
                    source,
                });
            }
            // All pipe instances are busy; the server is mid-request.
            Err(source) if Instant::now() < deadline => {
                debug!(target: TRANSPORT_TARGET, %source, "pipe busy, retrying");
                thread::sleep(CONNECT_RETRY);
            }
            Err(_) => {
                return Err(TransportError::Busy {
                    address: address.to_owned(),
                });
            }
        }
    }
}
