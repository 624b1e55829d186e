//! HTTP on a Unix domain socket between an adaptor and its application.

use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use adaptor_protocol::{PathMapping, PathMappingRule};
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{APPLICATION_TARGET, ActionsQueue, AppAction};
use crate::registry::SocketDirectories;
use crate::transport::TransportError;
use crate::transport::http::{MAX_HEADERS, content_length, read_head};

/// How long `GET /action` waits between checks for shutdown.
const ACTION_WAIT: Duration = Duration::from_millis(100);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const MISSING_PATH: &str = "Missing path in query string.";

/// Errors raised by the application server and its client.
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// No socket directory leaves room for the socket name.
    #[error("no socket directory can hold {name}")]
    NoSocketPath {
        /// The socket name that did not fit.
        name: String,
    },
    /// The socket could not be bound or served.
    #[error("failed to listen on {path}: {source}")]
    Listen {
        /// The socket path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The exchange with the peer failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The server answered with something other than success.
    #[error("application server answered {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// The response body was not the expected JSON.
    #[error("malformed application server response: {source}")]
    Decode {
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct MappedPath {
    path: String,
}

/// Serves an [`ActionsQueue`] and a [`PathMapping`] to the application.
///
/// Each connection carries one request and is answered on its own thread,
/// so a client waiting on `GET /action` does not hold up path lookups.
/// Shutting down, explicitly or on drop, stops accepting, answers waiting
/// action requests with 503 and removes the socket file.
#[derive(Debug)]
pub struct ApplicationServer {
    socket_path: PathBuf,
    closing: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

struct Routes {
    queue: ActionsQueue,
    path_mapping: Arc<PathMapping>,
    closing: Arc<AtomicBool>,
}

impl ApplicationServer {
    /// Listens on `application-<pid>` in the first socket directory with
    /// room for it.
    ///
    /// # Errors
    ///
    /// Returns [`ApplicationError::NoSocketPath`] when no directory fits and
    /// [`ApplicationError::Listen`] when the socket cannot be bound.
    pub fn start_in(
        directories: &SocketDirectories,
        queue: ActionsQueue,
        path_mapping: Arc<PathMapping>,
    ) -> Result<Self, ApplicationError> {
        let name = format!("application-{}", std::process::id());
        let socket_path = directories
            .place(&name)
            .ok_or(ApplicationError::NoSocketPath { name })?;
        Self::start(socket_path, queue, path_mapping)
    }

    /// Listens on `socket_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ApplicationError::Listen`] when the socket cannot be bound
    /// or its accept thread cannot be started.
    pub fn start(
        socket_path: impl Into<PathBuf>,
        queue: ActionsQueue,
        path_mapping: Arc<PathMapping>,
    ) -> Result<Self, ApplicationError> {
        let socket_path = socket_path.into();
        let listen_error = |source| ApplicationError::Listen {
            path: socket_path.clone(),
            source,
        };
        let listener = UnixListener::bind(&socket_path).map_err(listen_error)?;
        let closing = Arc::new(AtomicBool::new(false));
        let routes = Arc::new(Routes {
            queue,
            path_mapping,
            closing: Arc::clone(&closing),
        });
        let spawned = thread::Builder::new()
            .name("application-server".to_owned())
            .spawn(move || accept_loop(&listener, &routes));
        let acceptor = match spawned {
            Ok(acceptor) => acceptor,
            Err(source) => {
                remove_socket(&socket_path);
                return Err(listen_error(source));
            }
        };
        info!(
            target: APPLICATION_TARGET,
            socket = %socket_path.display(),
            "application server listening"
        );
        Ok(Self {
            socket_path,
            closing,
            acceptor: Some(acceptor),
        })
    }

    /// Path of the listening socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stops the server and removes its socket.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };
        self.closing.store(true, Ordering::SeqCst);
        // Wakes the accept loop so it sees the flag.
        if let Err(error) = UnixStream::connect(&self.socket_path) {
            debug!(target: APPLICATION_TARGET, %error, "accept loop already gone");
        }
        if acceptor.join().is_err() {
            warn!(target: APPLICATION_TARGET, "application accept thread panicked");
        }
        remove_socket(&self.socket_path);
        info!(
            target: APPLICATION_TARGET,
            socket = %self.socket_path.display(),
            "application server stopped"
        );
    }
}

impl Drop for ApplicationServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remove_socket(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != io::ErrorKind::NotFound {
            warn!(
                target: APPLICATION_TARGET,
                socket = %path.display(),
                %error,
                "failed to remove application socket"
            );
        }
    }
}

fn accept_loop(listener: &UnixListener, routes: &Arc<Routes>) {
    for incoming in listener.incoming() {
        if routes.closing.load(Ordering::SeqCst) {
            break;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(error) => {
                warn!(target: APPLICATION_TARGET, %error, "failed to accept application connection");
                continue;
            }
        };
        let shared = Arc::clone(routes);
        let spawned = thread::Builder::new()
            .name("application-request".to_owned())
            .spawn(move || {
                if let Err(error) = answer(stream, &shared) {
                    debug!(target: APPLICATION_TARGET, %error, "application request failed");
                }
            });
        if let Err(error) = spawned {
            warn!(target: APPLICATION_TARGET, %error, "failed to start a request thread");
        }
    }
}

fn answer(stream: UnixStream, routes: &Routes) -> Result<(), TransportError> {
    stream
        .set_read_timeout(Some(REQUEST_TIMEOUT))
        .map_err(|error| TransportError::io("configuring an application connection", error))?;
    let mut reader = BufReader::new(stream);
    let Some(head) = read_head(&mut reader)? else {
        return Ok(());
    };
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let reply = match request.parse(&head) {
        Ok(httparse::Status::Complete(_)) => routes.reply(request.method, request.path.unwrap_or_default()),
        _ => Reply::text(400, "Bad Request", "malformed request"),
    };
    debug!(
        target: APPLICATION_TARGET,
        target_path = request.path.unwrap_or_default(),
        status = reply.status,
        "answered application request"
    );
    reply.write_to(reader.get_mut())
}

impl Routes {
    fn reply(&self, method: Option<&str>, target: &str) -> Reply {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        match (method, path) {
            (Some("GET"), "/action") => self.next_action(),
            (Some("GET"), "/path_mapping") => match query_value(query, "path") {
                Some(raw) => Reply::json(&MappedPath {
                    path: self.path_mapping.map_path(&raw),
                }),
                None => Reply::text(400, "Bad Request", MISSING_PATH),
            },
            (Some("GET"), "/path_mapping_rules") => Reply::json(&*self.path_mapping),
            (_, "/action" | "/path_mapping" | "/path_mapping_rules") => {
                Reply::text(405, "Method Not Allowed", "only GET is supported")
            }
            _ => Reply::text(404, "Not Found", "no such resource"),
        }
    }

    fn next_action(&self) -> Reply {
        loop {
            if let Some(action) = self.queue.dequeue_timeout(ACTION_WAIT) {
                return Reply::json(&action);
            }
            if self.closing.load(Ordering::SeqCst) {
                return Reply::text(503, "Service Unavailable", "server is shutting down");
            }
        }
    }
}

/// First non-empty value of `key` in a form-encoded query string.
fn query_value(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            (decode_component(name) == key).then(|| decode_component(value))
        })
        .find(|value| !value.is_empty())
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

struct Reply {
    status: u16,
    reason: &'static str,
    content_type: &'static str,
    body: String,
}

impl Reply {
    fn text(status: u16, reason: &'static str, body: &str) -> Self {
        Self {
            status,
            reason,
            content_type: "text/plain",
            body: body.to_owned(),
        }
    }

    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self {
                status: 200,
                reason: "OK",
                content_type: "application/json",
                body,
            },
            Err(error) => Self::text(500, "Internal Server Error", &error.to_string()),
        }
    }

    fn write_to(&self, stream: &mut UnixStream) -> Result<(), TransportError> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason,
            self.content_type,
            self.body.len()
        );
        stream
            .write_all(head.as_bytes())
            .and_then(|()| stream.write_all(self.body.as_bytes()))
            .and_then(|()| stream.flush())
            .map_err(|error| TransportError::io("answering the application", error))
    }
}

/// The application's side of an [`ApplicationServer`].
#[derive(Debug, Clone)]
pub struct ApplicationClient {
    socket_path: PathBuf,
    timeout: Option<Duration>,
}

impl ApplicationClient {
    /// A client for the server at `socket_path` that waits as long as the
    /// server takes.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: None,
        }
    }

    /// Bounds how long each response may take.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Waits for the next queued action.
    ///
    /// # Errors
    ///
    /// Returns [`ApplicationError::Status`] with 503 when the server shuts
    /// down first, and other variants when the exchange fails.
    pub fn next_action(&self) -> Result<AppAction, ApplicationError> {
        self.get_json("/action")
    }

    /// Maps `path` with the adaptor's rules.
    ///
    /// # Errors
    ///
    /// Returns an [`ApplicationError`] when the exchange fails.
    pub fn map_path(&self, path: &str) -> Result<String, ApplicationError> {
        let target = format!("/path_mapping?path={}", utf8_percent_encode(path, NON_ALPHANUMERIC));
        self.get_json::<MappedPath>(&target).map(|mapped| mapped.path)
    }

    /// The adaptor's path mapping rules.
    ///
    /// # Errors
    ///
    /// Returns an [`ApplicationError`] when the exchange fails.
    pub fn path_mapping_rules(&self) -> Result<Vec<PathMappingRule>, ApplicationError> {
        self.get_json::<PathMapping>("/path_mapping_rules")
            .map(|mapping| mapping.rules().to_vec())
    }

    fn get_json<T: DeserializeOwned>(&self, target: &str) -> Result<T, ApplicationError> {
        let body = self.get(target)?;
        serde_json::from_slice(&body).map_err(|source| ApplicationError::Decode { source })
    }

    fn get(&self, target: &str) -> Result<Vec<u8>, ApplicationError> {
        let mut stream = UnixStream::connect(&self.socket_path).map_err(|source| {
            TransportError::ConnectionRefused {
                address: self.socket_path.display().to_string(),
                source,
            }
        })?;
        stream
            .set_read_timeout(self.timeout)
            .map_err(|error| TransportError::io("configuring the application client", error))?;
        write!(
            stream,
            "GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .map_err(|error| TransportError::io("sending an application request", error))?;

        let mut reader = BufReader::new(stream);
        let head = read_head(&mut reader)?.ok_or(TransportError::Closed)?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        if !matches!(response.parse(&head), Ok(httparse::Status::Complete(_))) {
            return Err(TransportError::framing("malformed application server response").into());
        }
        let length = content_length(response.headers)?
            .ok_or_else(|| TransportError::framing("application server response has no length"))?;
        if length > MAX_BODY_BYTES {
            return Err(TransportError::framing("application server response is too large").into());
        }
        let mut body = vec![0; length];
        reader
            .read_exact(&mut body)
            .map_err(|error| TransportError::io("reading an application response", error))?;
        match response.code.unwrap_or_default() {
            200 => Ok(body),
            status => Err(ApplicationError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }
}
