//! Waiting for a freshly spawned daemon to accept requests.

use std::path::Path;
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use adaptor_config::Config;
use adaptor_protocol::{ConnectionInfo, Frame, LifecycleState, Request, Response, exit_codes};
use tracing::{debug, info};

use super::reap::reap_child;
use super::{ProcessError, SUPERVISOR_TARGET, SupervisorError};
use crate::registry::{RegistryError, read_connection_file};
use crate::transport::{Connection, TransportError, for_kind};

const READY_POLL: Duration = Duration::from_millis(200);

enum Readiness {
    Pending,
    Ready(ConnectionInfo),
    Failed(ConnectionInfo, Response),
}

/// Polls until the daemon behind `child` publishes its connection file and
/// reports READY.
///
/// A daemon whose start callback failed is stopped and reported as
/// [`ProcessError::StartupCanceled`].
///
/// # Errors
///
/// Fails when the child exits early, start fails, or `config.startup_timeout`
/// elapses first. A child that exits because another daemon holds the
/// connection file's lock is reported as [`ProcessError::AlreadyRunning`].
pub(crate) fn await_ready(
    child: &mut Child,
    connection_file: &Path,
    config: &Config,
) -> Result<ConnectionInfo, SupervisorError> {
    let deadline = Instant::now() + config.startup_timeout;
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|source| ProcessError::MonitorChild { source })?
        {
            if status.code() == Some(i32::from(exit_codes::ADDRESS_UNAVAILABLE)) {
                let pid = read_connection_file(connection_file)
                    .ok()
                    .map(|info| info.pid)
                    .filter(|&owner| owner != child.id());
                return Err(ProcessError::AlreadyRunning {
                    pid,
                    path: connection_file.to_path_buf(),
                }
                .into());
            }
            return Err(ProcessError::StartupFailed {
                exit_status: status.to_string(),
            }
            .into());
        }
        match check_readiness(child.id(), connection_file, config)? {
            Readiness::Ready(info) => {
                info!(target: SUPERVISOR_TARGET, pid = info.pid, address = %info.address, "daemon ready");
                return Ok(info);
            }
            Readiness::Failed(info, response) => {
                let message = response
                    .error
                    .map_or_else(|| "start callback failed".to_owned(), |report| report.message);
                request_stop(&info, config);
                reap_child(child, config.reap_timeout);
                return Err(ProcessError::StartupCanceled { message }.into());
            }
            Readiness::Pending => {}
        }
        if Instant::now() >= deadline {
            reap_child(child, Duration::ZERO);
            return Err(ProcessError::StartupTimeout {
                timeout: config.startup_timeout,
            }
            .into());
        }
        thread::sleep(READY_POLL);
    }
}

fn check_readiness(pid: u32, connection_file: &Path, config: &Config) -> Result<Readiness, SupervisorError> {
    let info = match read_connection_file(connection_file) {
        Ok(info) => info,
        Err(RegistryError::ConnectionFileNotFound { .. }) => return Ok(Readiness::Pending),
        Err(error) => return Err(error.into()),
    };
    if info.pid != pid {
        debug!(target: SUPERVISOR_TARGET, owner = info.pid, "connection file not yet ours");
        return Ok(Readiness::Pending);
    }
    match query_status(&info, config) {
        Ok(response) => Ok(classify(info, response)),
        Err(error) if is_transient(&error) => {
            debug!(target: SUPERVISOR_TARGET, %error, "daemon not answering yet");
            Ok(Readiness::Pending)
        }
        Err(error) => Err(error.into()),
    }
}

fn classify(info: ConnectionInfo, response: Response) -> Readiness {
    match response.state {
        LifecycleState::Ready => Readiness::Ready(info),
        LifecycleState::Canceled
        | LifecycleState::Stopping
        | LifecycleState::Stopped
        | LifecycleState::CleanedUp => Readiness::Failed(info, response),
        LifecycleState::NotStarted | LifecycleState::Starting | LifecycleState::Running => {
            Readiness::Pending
        }
    }
}

const fn is_transient(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::ConnectionRefused { .. }
            | TransportError::Busy { .. }
            | TransportError::Timeout { .. }
    )
}

fn query_status(info: &ConnectionInfo, config: &Config) -> Result<Response, TransportError> {
    let transport = for_kind(info.transport)?;
    let mut connection = transport.connect(&info.address, config.connect_timeout)?;
    connection.set_receive_timeout(Some(config.connect_timeout))?;
    let response = single_response(connection.as_mut(), Request::status());
    connection.close();
    response
}

/// Sends `request` and skips any output until the response arrives.
fn single_response(connection: &mut dyn Connection, request: Request) -> Result<Response, TransportError> {
    connection.send(&Frame::Request(request))?;
    loop {
        match connection.receive()? {
            Some(Frame::Response(response)) => return Ok(response),
            Some(_) => {}
            None => return Err(TransportError::framing("daemon closed the connection before responding")),
        }
    }
}

fn request_stop(info: &ConnectionInfo, config: &Config) {
    let outcome = for_kind(info.transport).and_then(|transport| {
        let mut connection = transport.connect(&info.address, config.connect_timeout)?;
        connection.set_receive_timeout(Some(config.reap_timeout))?;
        single_response(connection.as_mut(), Request::stop())
    });
    if let Err(error) = outcome {
        debug!(target: SUPERVISOR_TARGET, %error, "stop after failed start was not delivered");
    }
}
