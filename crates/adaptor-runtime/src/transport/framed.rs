//! Length-prefixed frames on a duplex byte stream.
//!
//! Each frame is a big-endian `u32` byte count followed by that many bytes of
//! JSON. A stream that ends on a frame boundary is a clean close; one that
//! ends or times out inside a frame is malformed, and the connection that
//! read it is closed.

use std::io::{self, Read, Write};
use std::time::Duration;

use adaptor_protocol::{Frame, TransportKind};
use tracing::debug;

use super::{AddressNamespace, Connection, ServerHandle, TRANSPORT_TARGET, Transport, TransportError};

/// Largest frame body either side will send or accept.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const PREFIX_BYTES: usize = 4;

/// Writes one frame.
///
/// # Errors
///
/// Fails when the frame cannot be encoded, exceeds [`MAX_FRAME_BYTES`], or
/// the writer fails.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, frame: &Frame) -> Result<(), TransportError> {
    let body = frame
        .encode()
        .map_err(|source| TransportError::Encode { source })?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(TransportError::framing(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit",
            body.len()
        )));
    }
    let length = u32::try_from(body.len())
        .map_err(|_| TransportError::framing("frame length does not fit the prefix"))?;
    writer
        .write_all(&length.to_be_bytes())
        .and_then(|()| writer.write_all(&body))
        .and_then(|()| writer.flush())
        .map_err(|source| TransportError::io("writing frame", source))
}

/// Reads one frame, returning `None` at a clean end of stream.
///
/// # Errors
///
/// Returns [`TransportError::Framing`] for truncated, oversized, or
/// undecodable frames, and [`TransportError::Timeout`] when a read timeout
/// elapses before the first byte. A timeout after part of a frame arrived is
/// a framing error, since the stream can no longer be resynchronised.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Frame>, TransportError> {
    let mut prefix = [0_u8; PREFIX_BYTES];
    let mut filled = 0;
    while filled < PREFIX_BYTES {
        let Some(unfilled) = prefix.get_mut(filled..) else {
            break;
        };
        match reader.read(unfilled) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(TransportError::framing("stream ended inside a length prefix")),
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) if filled > 0 && timed_out(&error) => {
                return Err(TransportError::framing("timed out inside a length prefix"));
            }
            Err(error) => return Err(TransportError::io("reading frame", error)),
        }
    }
    let length = usize::try_from(u32::from_be_bytes(prefix))
        .map_err(|_| TransportError::framing("frame length does not fit in memory"))?;
    if length > MAX_FRAME_BYTES {
        return Err(TransportError::framing(format!(
            "frame of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
        )));
    }
    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body).map_err(|error| {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::framing("stream ended inside a frame body")
        } else if timed_out(&error) {
            TransportError::framing("timed out inside a frame body")
        } else {
            TransportError::io("reading frame", error)
        }
    })?;
    Frame::decode(&body)
        .map(Some)
        .map_err(|error| TransportError::framing(format!("invalid frame body: {error}")))
}

fn timed_out(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Byte stream carrying framed sessions.
pub(crate) trait ByteStream: Read + Write + Send {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn shutdown(&self) -> io::Result<()>;
}

#[cfg(unix)]
impl ByteStream for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        Self::shutdown(self, std::net::Shutdown::Both)
    }
}

/// A framed session over any [`ByteStream`].
pub(crate) struct FramedConnection<S> {
    stream: Option<S>,
}

impl<S: ByteStream> FramedConnection<S> {
    pub(crate) const fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    fn stream(&mut self) -> Result<&mut S, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

impl<S: ByteStream> Connection for FramedConnection<S> {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        write_frame(self.stream()?, frame)
    }

    fn receive(&mut self) -> Result<Option<Frame>, TransportError> {
        let received = read_frame(self.stream()?);
        if let Err(error) = &received {
            if !matches!(error, TransportError::Timeout { .. }) {
                debug!(target: TRANSPORT_TARGET, %error, "closing desynchronised stream");
                self.close();
            }
        }
        received
    }

    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.stream()?
            .set_read_timeout(timeout)
            .map_err(|source| TransportError::io("setting receive timeout", source))
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(error) = stream.shutdown() {
                debug!(target: TRANSPORT_TARGET, %error, "stream already disconnected");
            }
        }
    }
}

/// The pipe transport.
///
/// Uses a Unix domain socket on Unix and a named pipe on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramedTransport;

#[cfg(unix)]
struct FramedServer {
    socket: super::unix::BoundSocket,
}

#[cfg(unix)]
impl ServerHandle for FramedServer {
    fn address(&self) -> &str {
        self.socket.address()
    }

    fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        let stream = self.socket.accept()?;
        Ok(Box::new(FramedConnection::new(stream)))
    }

    fn try_accept(&mut self) -> Result<Option<Box<dyn Connection>>, TransportError> {
        let pending = self.socket.try_accept()?;
        Ok(pending.map(|stream| Box::new(FramedConnection::new(stream)) as Box<dyn Connection>))
    }
}

impl Transport for FramedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    fn namespace(&self) -> AddressNamespace {
        if cfg!(windows) {
            AddressNamespace::Named
        } else {
            AddressNamespace::Filesystem
        }
    }

    #[cfg(unix)]
    fn listen(&self, address: &str) -> Result<Box<dyn ServerHandle>, TransportError> {
        let socket = super::unix::BoundSocket::bind(address)?;
        Ok(Box::new(FramedServer { socket }))
    }

    #[cfg(windows)]
    fn listen(&self, address: &str) -> Result<Box<dyn ServerHandle>, TransportError> {
        super::pipe::listen(address)
    }

    #[cfg(unix)]
    fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn Connection>, TransportError> {
        let stream = super::unix::connect(address, timeout)?;
        Ok(Box::new(FramedConnection::new(stream)))
    }

    #[cfg(windows)]
    fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn Connection>, TransportError> {
        super::pipe::connect(address, timeout)
    }
}
