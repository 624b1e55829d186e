//! Local IPC between supervisors and daemons.
//!
//! Two transports carry the same [`Frame`] vocabulary. The pipe transport
//! writes length-prefixed JSON on a duplex byte stream. The socket transport
//! speaks HTTP/1.1 over a Unix domain socket and streams frames in a chunked
//! response body. Callers pick one with [`for_kind`] and then only deal with
//! the object-safe [`Transport`], [`ServerHandle`] and [`Connection`] traits.

mod errors;
mod framed;
#[cfg(unix)]
pub(crate) mod http;
#[cfg(windows)]
mod pipe;
#[cfg(unix)]
mod unix;

use std::sync::Arc;
use std::time::Duration;

use adaptor_protocol::{Frame, TransportKind};

pub use errors::TransportError;
pub use framed::{FramedTransport, MAX_FRAME_BYTES, read_frame, write_frame};
#[cfg(unix)]
pub use http::HttpTransport;

pub(crate) const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

/// Where a transport's addresses live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressNamespace {
    /// Addresses are paths of socket files.
    Filesystem,
    /// Addresses are names in a system-wide namespace.
    Named,
}

/// One side of an established session.
pub trait Connection: Send {
    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// Fails when the peer has gone away or the frame cannot be encoded.
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Receives the next frame, or `None` once the peer has finished.
    ///
    /// # Errors
    ///
    /// Fails on malformed input, a timeout, or an I/O error.
    fn receive(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Bounds how long [`Connection::receive`] may block.
    ///
    /// # Errors
    ///
    /// Fails when the underlying stream rejects the timeout.
    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError>;

    /// Closes the session. Closing twice is harmless.
    fn close(&mut self);
}

/// A bound listening address.
///
/// Dropping the handle stops listening and releases the address.
pub trait ServerHandle: Send {
    /// Address clients connect to.
    fn address(&self) -> &str;

    /// Blocks until the next client connects.
    ///
    /// # Errors
    ///
    /// Fails when the listener reports an error.
    fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError>;

    /// Returns a connection that is already waiting, without blocking.
    ///
    /// Servers that cannot poll report nothing pending.
    ///
    /// # Errors
    ///
    /// Fails when the listener reports an error.
    fn try_accept(&mut self) -> Result<Option<Box<dyn Connection>>, TransportError> {
        Ok(None)
    }
}

/// A local IPC mechanism.
pub trait Transport: Send + Sync {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Whether addresses are filesystem paths.
    fn namespace(&self) -> AddressNamespace;

    /// Starts listening on `address`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AddressInUse`] when a live server already
    /// owns the address.
    fn listen(&self, address: &str) -> Result<Box<dyn ServerHandle>, TransportError>;

    /// Connects to the server at `address`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionRefused`] when nothing listens at
    /// the address and [`TransportError::Busy`] when the server is not
    /// accepting.
    fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn Connection>, TransportError>;
}

/// Returns the transport implementing `kind` on this platform.
///
/// # Errors
///
/// Returns [`TransportError::Unsupported`] when the platform lacks it.
pub fn for_kind(kind: TransportKind) -> Result<Arc<dyn Transport>, TransportError> {
    match kind {
        TransportKind::Pipe => Ok(Arc::new(FramedTransport)),
        #[cfg(unix)]
        TransportKind::Socket => Ok(Arc::new(HttpTransport)),
        #[cfg(not(unix))]
        TransportKind::Socket => Err(TransportError::Unsupported { kind }),
    }
}
