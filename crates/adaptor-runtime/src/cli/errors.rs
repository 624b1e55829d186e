//! Top-level CLI failures and their exit codes.

use std::io;

use adaptor_config::ConfigError;
use adaptor_protocol::exit_codes;
use thiserror::Error;

use super::payload::PayloadError;
use crate::daemon::DaemonError;
use crate::supervisor::{ProcessError, SupervisorError};
use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("{0}")]
    CliUsage(clap::Error),
    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error("failed to write output: {0}")]
    Output(io::Error),
}

impl AppError {
    pub(crate) const fn exit_code(&self) -> u8 {
        match self {
            Self::CliUsage(_) | Self::Config(_) | Self::Payload(_) | Self::Telemetry(_) => {
                exit_codes::USAGE
            }
            Self::Supervisor(error) => error.exit_code(),
            Self::Process(error) => error.exit_code(),
            Self::Daemon(error) => error.exit_code(),
            Self::Output(_) => exit_codes::PROTOCOL,
        }
    }
}
