//! Launching the daemon process.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use adaptor_config::Config;
use tempfile::Builder;
use tracing::info;

use super::ProcessError;
use crate::process::PROCESS_TARGET;

/// Subcommand path of the hidden daemon entry point.
const SERVE_ARGS: [&str; 2] = ["daemon", "_serve"];

/// What a new daemon needs to know.
#[derive(Debug)]
pub(crate) struct LaunchSpec<'a> {
    pub(crate) binary: &'a Path,
    pub(crate) connection_file: &'a Path,
    pub(crate) init_data: &'a str,
    pub(crate) path_mapping: Option<&'a str>,
    pub(crate) log_file: &'a Path,
    pub(crate) config: &'a Config,
}

/// Creates the file that captures the daemon's early output and its
/// diagnostic log. It outlives the supervisor.
pub(crate) fn bootstrap_log() -> Result<PathBuf, ProcessError> {
    let file = Builder::new()
        .prefix("adaptor-daemon-")
        .suffix(".log")
        .tempfile()
        .map_err(|source| ProcessError::LogFile {
            path: std::env::temp_dir(),
            source,
        })?;
    file.into_temp_path()
        .keep()
        .map_err(|error| ProcessError::LogFile {
            path: error.path.to_path_buf(),
            source: error.error,
        })
}

fn open_log(path: &Path) -> Result<File, ProcessError> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|source| ProcessError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Starts the daemon detached from the caller's console.
pub(crate) fn spawn_daemon(spec: &LaunchSpec<'_>) -> Result<Child, ProcessError> {
    let stdout = open_log(spec.log_file)?;
    let stderr = stdout.try_clone().map_err(|source| ProcessError::LogFile {
        path: spec.log_file.to_path_buf(),
        source,
    })?;
    let mut command = Command::new(spec.binary);
    command
        .args(SERVE_ARGS)
        .arg("--connection-file")
        .arg(spec.connection_file)
        .arg("--init-data")
        .arg(spec.init_data)
        .arg("--log-file")
        .arg(spec.log_file)
        .args(
            spec.path_mapping
                .into_iter()
                .flat_map(|rules| ["--path-mapping-rules", rules]),
        )
        .envs(spec.config.to_env())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }
    let child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.binary.to_path_buf(),
        source,
    })?;
    info!(
        target: PROCESS_TARGET,
        pid = child.id(),
        log = %spec.log_file.display(),
        "daemon process launched"
    );
    Ok(child)
}
