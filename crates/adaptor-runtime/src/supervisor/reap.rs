//! Waiting for daemon processes to exit.

use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::ProcessError;
use crate::process::{PROCESS_TARGET, os};

const REAP_POLL: Duration = Duration::from_millis(50);

/// How a daemon process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// It exited on its own.
    Exited,
    /// It outlived the timeout and was killed.
    Killed,
}

/// Waits up to `timeout` for `pid` to exit, then kills it.
///
/// A kill is reported as a warning rather than an error; the stop itself
/// already succeeded.
pub(crate) fn reap(pid: u32, timeout: Duration) -> ReapOutcome {
    if wait_for_exit(pid, timeout) {
        return ReapOutcome::Exited;
    }
    let error = ProcessError::UngracefulExit { pid, timeout };
    warn!(target: PROCESS_TARGET, %error, "forcing daemon exit");
    if let Err(kill_error) = os::kill_now(pid) {
        debug!(target: PROCESS_TARGET, pid, error = %kill_error, "kill failed");
    }
    ReapOutcome::Killed
}

/// Polls until `pid` is gone or `timeout` elapses. Returns whether it exited.
pub(crate) fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match os::is_alive(pid) {
            Ok(false) => {
                debug!(target: PROCESS_TARGET, pid, "daemon exited");
                return true;
            }
            Ok(true) => {}
            Err(error) => {
                debug!(target: PROCESS_TARGET, pid, %error, "could not query daemon liveness");
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(REAP_POLL);
    }
}

/// Waits up to `timeout` for a child to exit, then kills and collects it.
pub(crate) fn reap_child(child: &mut Child, timeout: Duration) -> ReapOutcome {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return ReapOutcome::Exited,
            Ok(None) => thread::sleep(REAP_POLL),
            Err(error) => {
                debug!(target: PROCESS_TARGET, %error, "could not poll daemon child");
                break;
            }
        }
    }
    warn!(target: PROCESS_TARGET, pid = child.id(), "daemon child did not exit; killing it");
    if let Err(error) = child.kill() {
        debug!(target: PROCESS_TARGET, %error, "kill failed");
    }
    if let Err(error) = child.wait() {
        debug!(target: PROCESS_TARGET, %error, "could not collect daemon child");
    }
    ReapOutcome::Killed
}
