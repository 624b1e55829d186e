//! Subprocess supervision for adaptors that drive an external application.

use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use adaptor_protocol::{LogRecord, OutputStream};
use tracing::{debug, info};

use super::PROCESS_TARGET;
use super::regex_handler::RegexHandler;
use crate::adaptor::AdaptorError;
use crate::cancel::{CancellationToken, lock};
use crate::output::SharedSink;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// A child process whose output becomes log records and whose lifetime is
/// tied to the adaptor's cancellation token.
pub struct ManagedProcess {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    stdout_handler: Option<RegexHandler>,
    stderr_handler: Option<RegexHandler>,
    sink: SharedSink,
    token: CancellationToken,
}

impl ManagedProcess {
    pub(crate) fn new(program: impl AsRef<OsStr>, sink: SharedSink, token: CancellationToken) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            stdout_handler: None,
            stderr_handler: None,
            sink,
            token,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    /// Working directory of the child.
    #[must_use]
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Adds an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Handler applied to each stdout line.
    #[must_use]
    pub fn stdout_handler(mut self, handler: RegexHandler) -> Self {
        self.stdout_handler = Some(handler);
        self
    }

    /// Handler applied to each stderr line.
    #[must_use]
    pub fn stderr_handler(mut self, handler: RegexHandler) -> Self {
        self.stderr_handler = Some(handler);
        self
    }

    /// Runs the child to completion.
    ///
    /// Output is forwarded line by line while the child runs. Cancelling the
    /// token terminates the child, so this returns promptly after a
    /// cancellation even when the child would otherwise run forever.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::Canceled`] when cancellation was requested
    /// before launch, and [`AdaptorError::Spawn`] or [`AdaptorError::Io`]
    /// when the child cannot be launched or waited on.
    pub fn run(self) -> Result<ExitStatus, AdaptorError> {
        if self.token.is_cancelled() {
            return Err(AdaptorError::Canceled);
        }
        let program = self.program.to_string_lossy().into_owned();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|source| AdaptorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(target: PROCESS_TARGET, pid, program = %program, "managed process started");
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));
        let _registration = self.token.register_child(Arc::clone(&child));

        let status = thread::scope(|scope| {
            let readers = [
                stdout.map(|pipe| {
                    let handler = self.stdout_handler.as_ref();
                    let sink = &self.sink;
                    scope.spawn(move || pump(pipe, OutputStream::Stdout, sink, handler))
                }),
                stderr.map(|pipe| {
                    let handler = self.stderr_handler.as_ref();
                    let sink = &self.sink;
                    scope.spawn(move || pump(pipe, OutputStream::Stderr, sink, handler))
                }),
            ];
            let status = wait_for_exit(&child);
            for reader in readers.into_iter().flatten() {
                if reader.join().is_err() {
                    debug!(target: PROCESS_TARGET, pid, "output reader panicked");
                }
            }
            status
        })?;
        info!(
            target: PROCESS_TARGET,
            pid,
            program = %program,
            code = status.code(),
            "managed process exited"
        );
        Ok(status)
    }

    /// Runs the child and treats a non-zero exit as an error.
    ///
    /// # Errors
    ///
    /// As [`ManagedProcess::run`], plus [`AdaptorError::ProcessFailed`] for
    /// an unsuccessful exit and [`AdaptorError::Canceled`] when the child
    /// was stopped by cancellation.
    pub fn run_checked(self) -> Result<(), AdaptorError> {
        let program = self.program.to_string_lossy().into_owned();
        let token = self.token.clone();
        let status = self.run()?;
        if status.success() {
            return Ok(());
        }
        if token.is_cancelled() {
            return Err(AdaptorError::Canceled);
        }
        Err(AdaptorError::ProcessFailed {
            program,
            status: status.to_string(),
        })
    }
}

fn wait_for_exit(child: &Mutex<Child>) -> Result<ExitStatus, AdaptorError> {
    loop {
        if let Some(status) = lock(child).try_wait()? {
            return Ok(status);
        }
        thread::sleep(WAIT_POLL);
    }
}

fn pump<R: Read>(pipe: R, stream: OutputStream, sink: &SharedSink, handler: Option<&RegexHandler>) {
    let mut reader = BufReader::new(pipe);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                if let Some(handler) = handler {
                    handler.handle_line(line.trim_end_matches(['\r', '\n']));
                }
                let mut text = line.into_owned();
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                sink.emit(LogRecord::new(stream, text));
            }
            Err(error) => {
                debug!(target: PROCESS_TARGET, %error, "stopped reading child output");
                return;
            }
        }
    }
}
