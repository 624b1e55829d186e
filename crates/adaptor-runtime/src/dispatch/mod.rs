//! Single-flight request dispatch for a daemon.
//!
//! The dispatcher owns the [`Lifecycle`] and serves one connection at a
//! time, so requests against the adaptor never overlap. While a RUN or STOP
//! callback executes on the serving thread, a scoped emitter thread forwards
//! captured output to the client as log frames. The terminal response is sent
//! only after every record produced by the callback has been forwarded.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use adaptor_protocol::{Action, ErrorKind, ErrorReport, Frame, LogRecord, Request, Response};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::output::{ChannelSink, SharedSink, TracingSink};
use crate::transport::{Connection, ServerHandle, TransportError};

pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

const ERROR_BACKOFF: Duration = Duration::from_millis(150);
const MAX_ACCEPT_ERRORS: u32 = 20;
const MAX_DRAINED: usize = 64;
const DRAIN_RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors that end the serve loop early.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The listener kept failing to accept clients.
    #[error("failed to accept connections: {source}")]
    Accept {
        /// The last accept failure.
        #[source]
        source: TransportError,
    },
}

/// How serving ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeOutcome {
    /// Whether every lifecycle callback succeeded.
    pub clean: bool,
}

/// Serves requests against one adaptor lifecycle.
pub struct Dispatcher {
    lifecycle: Lifecycle,
    clean: bool,
}

impl Dispatcher {
    /// Wraps a lifecycle that has not started yet.
    #[must_use]
    pub const fn new(lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            clean: true,
        }
    }

    /// The lifecycle being served.
    #[must_use]
    pub const fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Starts the adaptor. Output goes to the diagnostic log since no client
    /// is attached yet.
    ///
    /// Returns whether the adaptor reached READY.
    pub fn start(&mut self) -> bool {
        let sink: SharedSink = Arc::new(TracingSink);
        match self.lifecycle.start(&sink) {
            Ok(()) => true,
            Err(error) => {
                warn!(target: DISPATCH_TARGET, %error, "adaptor failed to start");
                if matches!(error, LifecycleError::Callback { .. }) {
                    self.clean = false;
                }
                false
            }
        }
    }

    /// Accepts and handles connections until the lifecycle is cleaned up.
    ///
    /// Cancellation observed between connections tears the lifecycle down
    /// and ends serving. Clients already queued when serving ends are still
    /// answered, so none of them sees the connection drop unanswered.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Accept`] when accepting keeps failing. The
    /// lifecycle is torn down when the dispatcher is dropped.
    pub fn serve(&mut self, server: &mut dyn ServerHandle) -> Result<ServeOutcome, DispatchError> {
        info!(target: DISPATCH_TARGET, address = server.address(), "serving requests");
        let mut accept_errors = 0;
        loop {
            if self.lifecycle.state().is_terminal() {
                break;
            }
            if self.lifecycle.token().is_cancelled() {
                info!(target: DISPATCH_TARGET, "cancellation observed; tearing down");
                let sink: SharedSink = Arc::new(TracingSink);
                if let Err(error) = self.lifecycle.teardown(&sink) {
                    warn!(target: DISPATCH_TARGET, %error, "teardown after cancellation failed");
                    self.clean = false;
                }
                break;
            }
            let mut connection = match server.accept() {
                Ok(connection) => {
                    accept_errors = 0;
                    connection
                }
                Err(source) => {
                    accept_errors += 1;
                    if accept_errors == 1 {
                        warn!(target: DISPATCH_TARGET, error = %source, "accept failed");
                    }
                    if accept_errors >= MAX_ACCEPT_ERRORS {
                        return Err(DispatchError::Accept { source });
                    }
                    thread::sleep(ERROR_BACKOFF);
                    continue;
                }
            };
            self.handle(connection.as_mut());
            connection.close();
        }
        self.drain(server);
        info!(target: DISPATCH_TARGET, state = %self.lifecycle.state(), "stopped serving");
        Ok(ServeOutcome { clean: self.clean })
    }

    /// Answers connections that queued up behind the last request.
    fn drain(&mut self, server: &mut dyn ServerHandle) {
        for _ in 0..MAX_DRAINED {
            let mut connection = match server.try_accept() {
                Ok(Some(connection)) => connection,
                Ok(None) => return,
                Err(error) => {
                    debug!(target: DISPATCH_TARGET, %error, "could not poll for queued clients");
                    return;
                }
            };
            if let Err(error) = connection.set_receive_timeout(Some(DRAIN_RECEIVE_TIMEOUT)) {
                debug!(target: DISPATCH_TARGET, %error, "could not bound the queued request");
            }
            self.handle(connection.as_mut());
            connection.close();
        }
    }

    /// Handles the single request carried by `connection`.
    pub(crate) fn handle(&mut self, connection: &mut dyn Connection) {
        let request = match connection.receive() {
            Ok(Some(Frame::Request(request))) => request,
            Ok(Some(_)) => {
                warn!(target: DISPATCH_TARGET, "client sent a non-request frame");
                self.reject(connection, "expected a request frame");
                return;
            }
            Ok(None) => {
                debug!(target: DISPATCH_TARGET, "client disconnected without a request");
                return;
            }
            Err(error @ TransportError::Framing { .. }) => {
                warn!(target: DISPATCH_TARGET, %error, "malformed request");
                self.reject(connection, &error.to_string());
                return;
            }
            Err(error) => {
                warn!(target: DISPATCH_TARGET, %error, "failed to read request");
                return;
            }
        };
        debug!(target: DISPATCH_TARGET, action = %request.action, "dispatching request");
        let response = self.respond(connection, request);
        info!(
            target: DISPATCH_TARGET,
            status = %response.status,
            exit_code = response.exit_code,
            state = %response.state,
            "request handled"
        );
        if let Err(error) = connection.send(&Frame::Response(response)) {
            debug!(target: DISPATCH_TARGET, %error, "client gone before the response");
        }
    }

    fn respond(&mut self, connection: &mut dyn Connection, request: Request) -> Response {
        let state = self.lifecycle.state();
        match request.action {
            Action::Status => {
                let mut response = Response::ok(state);
                response.error = self.lifecycle.start_error().cloned();
                response
            }
            Action::Run | Action::Stop if self.lifecycle.token().is_cancelled() => Response::failed(
                state,
                ErrorReport::new(ErrorKind::Canceled, "daemon is shutting down after cancellation"),
            ),
            Action::Stop if state.is_terminal() => Response::ok(state),
            Action::Run => {
                let payload = request.payload.unwrap_or_default();
                self.stream_output(connection, |lifecycle, sink| lifecycle.run(&payload, sink))
            }
            Action::Stop => {
                let response = self.stream_output(connection, Lifecycle::shutdown);
                if !response.is_ok() && self.lifecycle.state().is_terminal() {
                    self.clean = false;
                }
                response
            }
        }
    }

    fn stream_output<F>(&mut self, connection: &mut dyn Connection, operation: F) -> Response
    where
        F: FnOnce(&mut Lifecycle, &SharedSink) -> Result<(), LifecycleError>,
    {
        let (channel, records) = ChannelSink::new();
        let sink: SharedSink = channel.clone();
        let lifecycle = &mut self.lifecycle;
        let client = &mut *connection;
        let outcome = thread::scope(|scope| {
            let emitter = scope.spawn(move || forward_records(client, records));
            let outcome = operation(lifecycle, &sink);
            channel.close();
            if emitter.join().is_err() {
                warn!(target: DISPATCH_TARGET, "output emitter panicked");
            }
            outcome
        });
        let state = self.lifecycle.state();
        match outcome {
            Ok(()) => Response::ok(state),
            Err(error) => Response::failed(state, error.to_report()),
        }
    }

    fn reject(&self, connection: &mut dyn Connection, message: &str) {
        let response = Response::failed(
            self.lifecycle.state(),
            ErrorReport::new(ErrorKind::Protocol, message),
        );
        if let Err(error) = connection.send(&Frame::Response(response)) {
            debug!(target: DISPATCH_TARGET, %error, "could not report protocol error");
        }
    }
}

/// Sends every record as a log frame until the queue closes.
///
/// After the first failed send the rest of the output is drained and
/// dropped; the callback keeps running regardless.
fn forward_records(connection: &mut dyn Connection, records: Receiver<LogRecord>) {
    let mut attached = true;
    for record in records {
        if !attached {
            continue;
        }
        if let Err(error) = connection.send(&Frame::Log(record)) {
            warn!(
                target: DISPATCH_TARGET,
                %error,
                "client stopped receiving; dropping output for this request"
            );
            attached = false;
        }
    }
}
