//! One request/response exchange from the client side.

use std::io::Write;

use adaptor_protocol::{Frame, OutputStream, Request, Response};
use tracing::debug;

use super::SupervisorError;
use super::SUPERVISOR_TARGET;
use crate::transport::{Connection, TransportError};

/// Sends `request` and forwards log frames until the response arrives.
///
/// # Errors
///
/// Returns a framing error when the daemon closes the connection before
/// responding, and [`SupervisorError::Forward`] when the console rejects
/// output.
pub(crate) fn exchange(
    connection: &mut dyn Connection,
    request: Request,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<Response, SupervisorError> {
    debug!(target: SUPERVISOR_TARGET, action = %request.action, "sending request");
    connection.send(&Frame::Request(request))?;
    loop {
        match connection.receive()? {
            Some(Frame::Log(record)) => {
                let target: &mut dyn Write = match record.stream {
                    OutputStream::Stdout => &mut *stdout,
                    OutputStream::Stderr => &mut *stderr,
                };
                target
                    .write_all(record.text.as_bytes())
                    .and_then(|()| target.flush())
                    .map_err(|source| SupervisorError::Forward { source })?;
            }
            Some(Frame::Response(response)) => {
                connection.close();
                return Ok(response);
            }
            Some(Frame::Request(_)) => {
                return Err(TransportError::framing("daemon sent a request frame").into());
            }
            None => {
                return Err(
                    TransportError::framing("daemon closed the connection before responding").into(),
                );
            }
        }
    }
}
