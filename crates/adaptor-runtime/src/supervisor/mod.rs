//! Client-side management of background daemons.
//!
//! The supervisor starts a daemon as a detached copy of the current
//! executable, waits until it reports READY, and afterwards reaches it
//! through the connection file for RUN, STOP and STATUS.

mod client;
mod errors;
mod ready;
mod reap;
mod signals;
mod spawn;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use adaptor_config::Config;
use adaptor_protocol::{ConnectionInfo, PathMapping, Payload, Request, Response};
use tracing::{debug, info, warn};

use crate::process::os;
use crate::registry::{RegistryError, invalidate, read_connection_file};
use crate::transport::{Connection, TransportError, for_kind};

pub use errors::{ProcessError, SupervisorError};
pub use reap::ReapOutcome;
pub use signals::SignalBridge;

pub(crate) const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervisor");

const LOG_TAIL_LINES: usize = 40;

/// Result of `daemon stop`.
#[derive(Debug)]
pub enum StopOutcome {
    /// The daemon handled STOP and its process was reaped.
    Stopped {
        /// The daemon's answer.
        response: Response,
        /// How the process ended.
        reaped: ReapOutcome,
    },
    /// No daemon was listening; a stale connection file was removed.
    AlreadyStopped,
    /// The daemon exited without answering, typically because a signal
    /// had already canceled it.
    Exited,
}

/// Starts and talks to daemons.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: Config,
    binary: PathBuf,
}

impl Supervisor {
    /// Supervises daemons running the current executable.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::CurrentExe`] when the executable path cannot
    /// be determined.
    pub fn new(config: Config) -> Result<Self, SupervisorError> {
        let binary = std::env::current_exe().map_err(|source| ProcessError::CurrentExe { source })?;
        Ok(Self::with_binary(config, binary))
    }

    /// Supervises daemons running `binary`.
    #[must_use]
    pub const fn with_binary(config: Config, binary: PathBuf) -> Self {
        Self { config, binary }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Spawns a daemon for `connection_file` and waits until it is READY.
    ///
    /// On failure the tail of the daemon's bootstrap log is copied to
    /// `stderr`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::AlreadyRunning`] when a live daemon already
    /// answers on the connection file, and startup errors otherwise.
    pub fn start(
        &self,
        connection_file: &Path,
        init_data: &Payload,
        path_mapping: &PathMapping,
        stderr: &mut dyn Write,
    ) -> Result<ConnectionInfo, SupervisorError> {
        self.clear_stale(connection_file)?;
        let init_json = serde_json::to_string(init_data)
            .map_err(|source| TransportError::Encode { source })?;
        let mapping_json = if path_mapping.is_empty() {
            None
        } else {
            Some(serde_json::to_string(path_mapping).map_err(|source| TransportError::Encode { source })?)
        };
        let log_file = spawn::bootstrap_log()?;
        let mut child = spawn::spawn_daemon(&spawn::LaunchSpec {
            binary: &self.binary,
            connection_file,
            init_data: &init_json,
            path_mapping: mapping_json.as_deref(),
            log_file: &log_file,
            config: &self.config,
        })?;
        match ready::await_ready(&mut child, connection_file, &self.config) {
            Ok(info) => Ok(info),
            Err(error) => {
                write_log_tail(&log_file, stderr);
                Err(error)
            }
        }
    }

    /// Sends RUN and streams the daemon's output to `stdout` and `stderr`.
    ///
    /// Interrupts received meanwhile are forwarded to the daemon, which
    /// cancels the run and answers CANCELED.
    ///
    /// # Errors
    ///
    /// Fails when the connection file is unusable, the daemon cannot be
    /// reached, or the exchange breaks off.
    pub fn run(
        &self,
        connection_file: &Path,
        run_data: Payload,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<Response, SupervisorError> {
        let info = read_connection_file(connection_file)?;
        let mut connection = self.connect(&info)?;
        let pid = info.pid;
        let _bridge = SignalBridge::install(move |_signal| {
            if let Err(error) = os::interrupt(pid) {
                signals::log_forward_failure(pid, &error);
            }
        })?;
        client::exchange(connection.as_mut(), Request::run(run_data), stdout, stderr)
    }

    /// Sends STOP, forwards its output, then reaps the daemon process.
    ///
    /// # Errors
    ///
    /// Fails when the connection file is unusable or the exchange breaks
    /// off while the daemon keeps running. An unreachable daemon, or one
    /// that exits instead of answering, is not an error.
    pub fn stop(
        &self,
        connection_file: &Path,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<StopOutcome, SupervisorError> {
        let info = read_connection_file(connection_file)?;
        let mut connection = match self.connect(&info) {
            Ok(connection) => connection,
            Err(error) if error.is_refused() => {
                info!(target: SUPERVISOR_TARGET, pid = info.pid, "daemon is not running");
                invalidate(connection_file, Some(info.pid));
                return Ok(StopOutcome::AlreadyStopped);
            }
            Err(error) => return Err(error.into()),
        };
        let response = match client::exchange(connection.as_mut(), Request::stop(), stdout, stderr) {
            Ok(response) => response,
            Err(SupervisorError::Transport(error)) => {
                if !reap::wait_for_exit(info.pid, self.config.reap_timeout) {
                    return Err(error.into());
                }
                info!(target: SUPERVISOR_TARGET, pid = info.pid, %error, "daemon exited without answering stop");
                invalidate(connection_file, Some(info.pid));
                return Ok(StopOutcome::Exited);
            }
            Err(error) => return Err(error),
        };
        let reaped = reap::reap(info.pid, self.config.reap_timeout);
        invalidate(connection_file, Some(info.pid));
        Ok(StopOutcome::Stopped { response, reaped })
    }

    /// Asks the daemon for its lifecycle state.
    ///
    /// # Errors
    ///
    /// Fails when the connection file is unusable or the daemon cannot be
    /// reached.
    pub fn status(&self, connection_file: &Path) -> Result<Response, SupervisorError> {
        let info = read_connection_file(connection_file)?;
        let mut connection = self.connect(&info)?;
        connection.set_receive_timeout(Some(self.config.connect_timeout))?;
        client::exchange(
            connection.as_mut(),
            Request::status(),
            &mut std::io::sink(),
            &mut std::io::sink(),
        )
    }

    fn connect(&self, info: &ConnectionInfo) -> Result<Box<dyn Connection>, TransportError> {
        let transport = for_kind(info.transport)?;
        debug!(target: SUPERVISOR_TARGET, address = %info.address, pid = info.pid, "connecting");
        transport.connect(&info.address, self.config.connect_timeout)
    }

    /// Refuses to start over a live daemon and removes leftovers of a dead
    /// one.
    fn clear_stale(&self, connection_file: &Path) -> Result<(), SupervisorError> {
        let info = match read_connection_file(connection_file) {
            Ok(info) => info,
            Err(RegistryError::ConnectionFileNotFound { .. }) => return Ok(()),
            Err(RegistryError::ConnectionFileCorrupt { .. }) => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    file = %connection_file.display(),
                    "removing corrupt connection file"
                );
                invalidate(connection_file, None);
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };
        match self.connect(&info) {
            Ok(mut connection) => {
                connection.close();
                Err(ProcessError::AlreadyRunning {
                    pid: Some(info.pid),
                    path: connection_file.to_path_buf(),
                }
                .into())
            }
            Err(error) if error.is_refused() => {
                info!(target: SUPERVISOR_TARGET, pid = info.pid, "removing stale connection file");
                invalidate(connection_file, Some(info.pid));
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

fn write_log_tail(log_file: &Path, stderr: &mut dyn Write) {
    let contents = match fs::read_to_string(log_file) {
        Ok(contents) => contents,
        Err(error) => {
            debug!(target: SUPERVISOR_TARGET, %error, "daemon log unreadable");
            return;
        }
    };
    let lines: Vec<&str> = contents.lines().collect();
    let skip = lines.len().saturating_sub(LOG_TAIL_LINES);
    let mut text = format!("daemon log ({}):\n", log_file.display());
    for line in lines.iter().skip(skip) {
        text.push_str("  ");
        text.push_str(line);
        text.push('\n');
    }
    if let Err(error) = stderr.write_all(text.as_bytes()) {
        debug!(target: SUPERVISOR_TARGET, %error, "could not print daemon log");
    }
}
