//! The callback contract an adaptor implements.
//!
//! Only [`Adaptor::on_run`] is required. Every other callback has a no-op
//! default, so an adaptor overrides exactly the phases it cares about.

use std::error::Error as StdError;
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::sync::Arc;

use adaptor_protocol::{LogRecord, OutputStream, PathMapping, PathMappingRule, Payload};
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::output::{OutputWriter, SharedSink};
use crate::process::ManagedProcess;

/// Stdout prefix announcing progress, as a percentage.
pub const PROGRESS_PREFIX: &str = "openjd_progress: ";
/// Stdout prefix announcing a status message.
pub const STATUS_PREFIX: &str = "openjd_status: ";
/// Stderr prefix announcing a failure.
pub const FAIL_PREFIX: &str = "openjd_fail: ";

/// Lifecycle callbacks of an adaptor.
///
/// The runtime calls these from a single thread and never concurrently.
/// Output written through the [`CallbackContext`] reaches whichever client
/// issued the current request.
pub trait Adaptor: Send {
    /// Loads the application. Called once, before any run.
    fn on_start(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        Ok(())
    }

    /// Performs one unit of work.
    fn on_run(&mut self, run_data: &Payload, ctx: &CallbackContext) -> Result<(), AdaptorError>;

    /// Shuts the application down. Called once.
    fn on_stop(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        Ok(())
    }

    /// Releases remaining resources. Called once, after `on_stop`.
    fn on_cleanup(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        Ok(())
    }

    /// Reacts to a cancellation request. Called at most once, before
    /// `on_stop`.
    fn on_cancel(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        Ok(())
    }
}

/// Errors returned by adaptor callbacks.
#[derive(Debug, Error)]
pub enum AdaptorError {
    /// Domain failure described by a message.
    #[error("{0}")]
    Failed(String),
    /// Init or run data did not have the expected shape.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// The callback observed cancellation and gave up.
    #[error("operation canceled")]
    Canceled,
    /// A subprocess could not be launched.
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// A subprocess finished unsuccessfully.
    #[error("'{program}' exited with {status}")]
    ProcessFailed {
        /// Program that failed.
        program: String,
        /// Rendered exit status.
        status: String,
    },
    /// I/O failure inside a callback.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Any other error.
    #[error(transparent)]
    Other(Box<dyn StdError + Send + Sync>),
}

impl AdaptorError {
    /// Builds a [`AdaptorError::Failed`] from a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Handle given to every callback.
#[derive(Clone)]
pub struct CallbackContext {
    sink: SharedSink,
    token: CancellationToken,
    path_mapping: Arc<PathMapping>,
}

impl CallbackContext {
    pub(crate) fn new(sink: SharedSink, token: CancellationToken) -> Self {
        Self {
            sink,
            token,
            path_mapping: Arc::default(),
        }
    }

    pub(crate) fn with_path_mapping(mut self, path_mapping: Arc<PathMapping>) -> Self {
        self.path_mapping = path_mapping;
        self
    }

    /// Writer whose lines become stdout records.
    #[must_use]
    pub fn stdout(&self) -> OutputWriter {
        OutputWriter::new(Arc::clone(&self.sink), OutputStream::Stdout)
    }

    /// Writer whose lines become stderr records.
    #[must_use]
    pub fn stderr(&self) -> OutputWriter {
        OutputWriter::new(Arc::clone(&self.sink), OutputStream::Stderr)
    }

    /// Emits `text` as a single record.
    pub fn emit(&self, stream: OutputStream, text: impl Into<String>) {
        self.sink.emit(LogRecord::new(stream, text));
    }

    /// Reports progress as a percentage.
    pub fn update_progress(&self, percent: f32) {
        self.emit(OutputStream::Stdout, format!("{PROGRESS_PREFIX}{percent:.1}\n"));
    }

    /// Reports a status message.
    pub fn update_status(&self, status: &str) {
        self.emit(OutputStream::Stdout, format!("{STATUS_PREFIX}{status}\n"));
    }

    /// Cancellation token for the current lifecycle.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The path mapping the adaptor was started with, shareable with an
    /// [`ApplicationServer`](crate::application::ApplicationServer).
    #[must_use]
    pub fn path_mapping(&self) -> Arc<PathMapping> {
        Arc::clone(&self.path_mapping)
    }

    /// Path mapping rules the adaptor was started with.
    #[must_use]
    pub fn path_mapping_rules(&self) -> &[PathMappingRule] {
        self.path_mapping.rules()
    }

    /// Rewrites `path` with the first matching path mapping rule. Paths no
    /// rule covers come back unchanged.
    #[must_use]
    pub fn map_path(&self, path: &str) -> String {
        self.path_mapping.map_path(path)
    }

    /// Prepares a subprocess whose output and lifetime follow this context.
    pub fn managed_process(&self, program: impl AsRef<OsStr>) -> ManagedProcess {
        ManagedProcess::new(program, Arc::clone(&self.sink), self.token.clone())
    }
}

impl fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackContext")
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

type BuildFn = dyn Fn(Payload) -> Result<Box<dyn Adaptor>, AdaptorError> + Send + Sync;

/// Builds adaptors from init data.
pub struct AdaptorFactory {
    build: Box<BuildFn>,
}

impl AdaptorFactory {
    /// Wraps a constructor.
    pub fn new<A, F>(build: F) -> Self
    where
        A: Adaptor + 'static,
        F: Fn(Payload) -> Result<A, AdaptorError> + Send + Sync + 'static,
    {
        Self {
            build: Box::new(move |init_data| {
                build(init_data).map(|adaptor| Box::new(adaptor) as Box<dyn Adaptor>)
            }),
        }
    }

    /// Builds an adaptor.
    ///
    /// A construction failure yields a stand-in whose start fails with the
    /// same error, so the failure flows through the normal start path.
    #[must_use]
    pub fn create(&self, init_data: Payload) -> Box<dyn Adaptor> {
        match (self.build)(init_data) {
            Ok(adaptor) => adaptor,
            Err(error) => Box::new(Unconstructed { error: Some(error) }),
        }
    }
}

impl fmt::Debug for AdaptorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptorFactory").finish_non_exhaustive()
    }
}

struct Unconstructed {
    error: Option<AdaptorError>,
}

impl Adaptor for Unconstructed {
    fn on_start(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        Err(self
            .error
            .take()
            .unwrap_or_else(|| AdaptorError::msg("adaptor could not be constructed")))
    }

    fn on_run(&mut self, _run_data: &Payload, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        Err(AdaptorError::msg("adaptor was never constructed"))
    }
}
