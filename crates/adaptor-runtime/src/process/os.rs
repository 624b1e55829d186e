//! Signalling and liveness checks for processes identified by pid.

use std::io;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{Signal, kill};
#[cfg(unix)]
use nix::unistd::Pid;

/// Whether a process with `pid` is still running.
///
/// Zombies count as exited on Linux so a daemon whose parent has not reaped
/// it yet is not waited on needlessly.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> io::Result<bool> {
    let Some(raw) = to_pid(pid) else {
        return Ok(false);
    };
    match kill(raw, None) {
        Ok(()) => Ok(!is_zombie(pid)),
        Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

/// Asks the process to terminate gracefully.
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<()> {
    send(pid, Signal::SIGTERM)
}

/// Delivers an interrupt, the same signal a terminal sends on Ctrl-C.
#[cfg(unix)]
pub fn interrupt(pid: u32) -> io::Result<()> {
    send(pid, Signal::SIGINT)
}

/// Kills the process without giving it a chance to clean up.
#[cfg(unix)]
pub fn kill_now(pid: u32) -> io::Result<()> {
    send(pid, Signal::SIGKILL)
}

#[cfg(unix)]
fn send(pid: u32, signal: Signal) -> io::Result<()> {
    let raw = to_pid(pid).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}"))
    })?;
    match kill(raw, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name is parenthesised and may itself contain spaces.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state == 'Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
const fn is_zombie(_pid: u32) -> bool {
    false
}

/// Whether a process with `pid` is still running.
#[cfg(windows)]
pub fn is_alive(pid: u32) -> io::Result<bool> {
    let output = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .output()?;
    let listing = String::from_utf8_lossy(&output.stdout);
    Ok(listing.contains(&format!("\"{pid}\"")))
}

/// Asks the process to terminate gracefully.
#[cfg(windows)]
pub fn terminate(pid: u32) -> io::Result<()> {
    taskkill(pid, false)
}

/// Delivers the closest Windows equivalent of an interrupt.
#[cfg(windows)]
pub fn interrupt(pid: u32) -> io::Result<()> {
    taskkill(pid, false)
}

/// Kills the process without giving it a chance to clean up.
#[cfg(windows)]
pub fn kill_now(pid: u32) -> io::Result<()> {
    taskkill(pid, true)
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> io::Result<()> {
    let mut command = std::process::Command::new("taskkill");
    command.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        command.arg("/F");
    }
    command.output().map(|_| ())
}
