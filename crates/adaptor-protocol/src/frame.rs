use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::exit_codes;
use crate::state::LifecycleState;

/// Opaque key-value data forwarded to adaptor callbacks.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// One discrete message on a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Client to daemon. Exactly one per connection.
    Request(Request),
    /// Daemon to client. Zero or more before the response.
    Log(LogRecord),
    /// Daemon to client. Always the last frame of an exchange.
    Response(Response),
}

impl Frame {
    /// Serialises the frame to its JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload value cannot be represented as JSON.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a frame from its JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are not a valid frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Operation a client asks the daemon to perform.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    /// Invoke the adaptor's run callback.
    Run,
    /// Stop and clean up the adaptor, then exit.
    Stop,
    /// Report the lifecycle state without side effects.
    Status,
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Requested operation.
    pub action: Action,
    /// Data forwarded to the callback, when the action takes any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl Request {
    /// A run request carrying `payload`.
    #[must_use]
    pub const fn run(payload: Payload) -> Self {
        Self {
            action: Action::Run,
            payload: Some(payload),
        }
    }

    /// A stop request.
    #[must_use]
    pub const fn stop() -> Self {
        Self {
            action: Action::Stop,
            payload: None,
        }
    }

    /// A status request.
    #[must_use]
    pub const fn status() -> Self {
        Self {
            action: Action::Status,
            payload: None,
        }
    }
}

/// Outcome category of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResponseStatus {
    /// The request succeeded.
    Ok,
    /// The request failed; see the attached error.
    Failed,
}

/// Terminal frame of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Success or failure.
    pub status: ResponseStatus,
    /// Exit code the client process should report.
    pub exit_code: i32,
    /// Daemon lifecycle state after the request was handled.
    pub state: LifecycleState,
    /// Details of a failure, or of a failed start when reporting status.
    #[serde(default)]
    pub error: Option<ErrorReport>,
}

impl Response {
    /// A successful response.
    #[must_use]
    pub const fn ok(state: LifecycleState) -> Self {
        Self {
            status: ResponseStatus::Ok,
            exit_code: 0,
            state,
            error: None,
        }
    }

    /// A failed response whose exit code follows the error kind.
    #[must_use]
    pub fn failed(state: LifecycleState, error: ErrorReport) -> Self {
        Self {
            status: ResponseStatus::Failed,
            exit_code: i32::from(error.kind.exit_code()),
            state,
            error: Some(error),
        }
    }

    /// Whether the request succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// Category of a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// An adaptor callback returned an error.
    Callback,
    /// The action is not valid in the current lifecycle state.
    InvalidTransition,
    /// The work was canceled.
    Canceled,
    /// The request could not be understood.
    Protocol,
    /// The daemon failed for reasons outside the adaptor.
    Internal,
}

impl ErrorKind {
    /// Exit code reported to the client for this kind of failure.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Callback => exit_codes::CALLBACK_FAILED,
            Self::InvalidTransition => exit_codes::INVALID_TRANSITION,
            Self::Canceled => exit_codes::CANCELED,
            Self::Protocol => exit_codes::PROTOCOL,
            Self::Internal => exit_codes::STARTUP_FAILED,
        }
    }
}

/// Structured failure carried by a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl ErrorReport {
    /// Builds a report.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Stream a log record was written to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// A piece of output captured while a callback ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Destination stream on the client.
    pub stream: OutputStream,
    /// Raw text, including any trailing newline.
    pub text: String,
}

impl LogRecord {
    /// Builds a record for `stream`.
    pub fn new(stream: OutputStream, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }
}
