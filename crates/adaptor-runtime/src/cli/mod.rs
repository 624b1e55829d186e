//! The command-line contract every adaptor binary exposes.
//!
//! An adaptor's `main` builds an [`EntryPoint`] from its name and
//! [`AdaptorFactory`] and hands it the process arguments. The entry point
//! owns argument parsing, configuration, telemetry and the mapping from
//! failures to exit codes, with the IO streams supplied by the caller so
//! tests can capture them.

mod args;
mod errors;
mod payload;

#[cfg(test)]
mod tests;

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use adaptor_config::Config;
use adaptor_protocol::{Response, exit_codes};
use clap::{CommandFactory, FromArgMatches};
use tracing::debug;

use crate::adaptor::AdaptorFactory;
use crate::daemon::{ServeOptions, run_daemon};
use crate::foreground::run_foreground;
use crate::supervisor::{StopOutcome, Supervisor};
use crate::telemetry;

use args::{Cli, CliCommand, ConnectionArgs, DaemonAction, DaemonRunArgs, RunArgs, ServeArgs, StartArgs};
use errors::AppError;
use payload::{parse_path_mapping, parse_payload};

pub use payload::PayloadError;

const CLI_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::cli");

/// Runs an adaptor's command line.
pub struct EntryPoint {
    name: String,
    factory: AdaptorFactory,
}

impl EntryPoint {
    /// Names the adaptor and how to build it.
    pub fn new(name: impl Into<String>, factory: AdaptorFactory) -> Self {
        Self {
            name: name.into(),
            factory,
        }
    }

    /// Parses `args` and executes the selected command.
    ///
    /// `stdout` receives adaptor output and command results; `stderr`
    /// receives adaptor errors and diagnostics.
    #[must_use]
    pub fn run<I>(&self, args: I, stdout: &mut dyn Write, stderr: &mut dyn Write) -> ExitCode
    where
        I: IntoIterator<Item = OsString>,
    {
        let matches = Cli::command()
            .bin_name(self.name.clone())
            .try_get_matches_from(args)
            .and_then(|matches| Cli::from_arg_matches(&matches));
        let cli = match matches {
            Ok(cli) => cli,
            Err(error) if !error.use_stderr() => {
                return match write!(stdout, "{}", error.render()) {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(_) => ExitCode::from(exit_codes::PROTOCOL),
                };
            }
            Err(error) => return Self::fail(&AppError::CliUsage(error), stderr),
        };
        match self.dispatch(cli, stdout, stderr) {
            Ok(code) => ExitCode::from(code),
            Err(error) => Self::fail(&error, stderr),
        }
    }

    fn fail(error: &AppError, stderr: &mut dyn Write) -> ExitCode {
        let code = error.exit_code();
        debug!(target: CLI_TARGET, %error, code, "command failed");
        if writeln!(stderr, "{error}").is_err() {
            return ExitCode::from(exit_codes::PROTOCOL);
        }
        ExitCode::from(code)
    }

    fn dispatch(&self, cli: Cli, stdout: &mut dyn Write, stderr: &mut dyn Write) -> Result<u8, AppError> {
        let config = Config::load(&cli.config)?;
        match cli.command {
            CliCommand::Run(args) => self.run_here(args, &config, stdout, stderr),
            CliCommand::Daemon { action } => match action {
                DaemonAction::Serve(args) => self.serve(args, &config, stderr),
                DaemonAction::Start(args) => start(&client(config)?, args, stderr),
                DaemonAction::Run(args) => run_remote(&client(config)?, args, stdout, stderr),
                DaemonAction::Stop(args) => stop(&client(config)?, &args, stdout, stderr),
                DaemonAction::Status(args) => status(&client(config)?, &args, stdout, stderr),
            },
        }
    }

    fn run_here(
        &self,
        args: RunArgs,
        config: &Config,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<u8, AppError> {
        telemetry::initialise(config, None)?;
        let init_data = parse_payload(args.init_data.as_deref())?;
        let path_mapping = parse_path_mapping(args.path_mapping_rules.as_deref())?;
        let run_data = parse_payload(args.run_data.as_deref())?;
        Ok(run_foreground(
            &self.factory,
            init_data,
            path_mapping,
            &run_data,
            config,
            stdout,
            stderr,
        )?)
    }

    fn serve(&self, args: ServeArgs, config: &Config, stderr: &mut dyn Write) -> Result<u8, AppError> {
        let init_data = parse_payload(args.init_data.as_deref())?;
        let path_mapping = parse_path_mapping(args.path_mapping_rules.as_deref())?;
        let options = ServeOptions {
            connection_file: args.connection.connection_file,
            init_data,
            path_mapping,
            log_file: args.log_file,
        };
        let outcome = run_daemon(&self.name, &self.factory, options, config)?;
        if outcome.clean {
            return Ok(exit_codes::SUCCESS);
        }
        writeln!(stderr, "adaptor callbacks failed; see the daemon log").map_err(AppError::Output)?;
        Ok(exit_codes::CALLBACK_FAILED)
    }
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn client(config: Config) -> Result<Supervisor, AppError> {
    telemetry::initialise(&config, None)?;
    Ok(Supervisor::new(config)?)
}

fn start(supervisor: &Supervisor, args: StartArgs, stderr: &mut dyn Write) -> Result<u8, AppError> {
    let init_data = parse_payload(args.init_data.as_deref())?;
    let path_mapping = parse_path_mapping(args.path_mapping_rules.as_deref())?;
    let info = supervisor.start(&args.connection.connection_file, &init_data, &path_mapping, stderr)?;
    writeln!(
        stderr,
        "daemon ready (pid {}, {} {})",
        info.pid, info.transport, info.address
    )
    .map_err(AppError::Output)?;
    Ok(exit_codes::SUCCESS)
}

fn run_remote(
    supervisor: &Supervisor,
    args: DaemonRunArgs,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<u8, AppError> {
    let run_data = parse_payload(args.run_data.as_deref())?;
    let response = supervisor.run(&args.connection.connection_file, run_data, stdout, stderr)?;
    report(&response, stderr)
}

fn stop(
    supervisor: &Supervisor,
    args: &ConnectionArgs,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<u8, AppError> {
    match supervisor.stop(&args.connection_file, stdout, stderr)? {
        StopOutcome::Stopped { response, .. } => report(&response, stderr),
        StopOutcome::AlreadyStopped => {
            writeln!(stderr, "no daemon is running; removed its stale connection file")
                .map_err(AppError::Output)?;
            Ok(exit_codes::SUCCESS)
        }
        StopOutcome::Exited => {
            writeln!(stderr, "daemon exited before answering stop").map_err(AppError::Output)?;
            Ok(exit_codes::SUCCESS)
        }
    }
}

fn status(
    supervisor: &Supervisor,
    args: &ConnectionArgs,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<u8, AppError> {
    let response = supervisor.status(&args.connection_file)?;
    writeln!(stdout, "{}", response.state).map_err(AppError::Output)?;
    if let Some(report) = &response.error {
        writeln!(stderr, "{}", report.message).map_err(AppError::Output)?;
    }
    Ok(exit_codes::SUCCESS)
}

/// Surfaces a daemon's failure message and converts its exit code.
fn report(response: &Response, stderr: &mut dyn Write) -> Result<u8, AppError> {
    if let Some(report) = response.error.as_ref().filter(|_| !response.is_ok()) {
        writeln!(stderr, "{}", report.message).map_err(AppError::Output)?;
    }
    Ok(u8::try_from(response.exit_code).unwrap_or(exit_codes::CALLBACK_FAILED))
}
