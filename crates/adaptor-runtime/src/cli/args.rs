//! Command-line definitions shared by every adaptor binary.

use std::path::PathBuf;

use adaptor_config::ConfigOverrides;
use clap::{Args, Parser, Subcommand};

/// Command-line interface of an adaptor.
#[derive(Parser, Debug)]
#[command(version, disable_help_subcommand = true)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) config: ConfigOverrides,
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Runs start, one run, stop and cleanup in this process.
    Run(RunArgs),
    /// Manages a background daemon that keeps the adaptor loaded.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum DaemonAction {
    /// Starts a daemon and waits until it is ready.
    Start(StartArgs),
    /// Sends one unit of work to a running daemon.
    Run(DaemonRunArgs),
    /// Stops a running daemon.
    Stop(ConnectionArgs),
    /// Prints the daemon's lifecycle state.
    Status(ConnectionArgs),
    /// Daemon process entry point, launched by `daemon start`.
    #[command(name = "_serve", hide = true)]
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Init data: a JSON object, or `file://<path>` to a JSON file.
    #[arg(long, value_name = "JSON")]
    pub(crate) init_data: Option<String>,
    /// Path mapping rules: `{"path_mapping_rules": [...]}`, or
    /// `file://<path>` to a JSON file.
    #[arg(long, value_name = "JSON")]
    pub(crate) path_mapping_rules: Option<String>,
    /// Run data: a JSON object, or `file://<path>` to a JSON file.
    #[arg(long, value_name = "JSON")]
    pub(crate) run_data: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct ConnectionArgs {
    /// File holding the daemon's connection details.
    #[arg(long, value_name = "PATH")]
    pub(crate) connection_file: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct StartArgs {
    #[command(flatten)]
    pub(crate) connection: ConnectionArgs,
    /// Init data: a JSON object, or `file://<path>` to a JSON file.
    #[arg(long, value_name = "JSON")]
    pub(crate) init_data: Option<String>,
    /// Path mapping rules: `{"path_mapping_rules": [...]}`, or
    /// `file://<path>` to a JSON file.
    #[arg(long, value_name = "JSON")]
    pub(crate) path_mapping_rules: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct DaemonRunArgs {
    #[command(flatten)]
    pub(crate) connection: ConnectionArgs,
    /// Run data: a JSON object, or `file://<path>` to a JSON file.
    #[arg(long, value_name = "JSON")]
    pub(crate) run_data: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct ServeArgs {
    #[command(flatten)]
    pub(crate) connection: ConnectionArgs,
    #[arg(long, value_name = "JSON")]
    pub(crate) init_data: Option<String>,
    #[arg(long, value_name = "JSON")]
    pub(crate) path_mapping_rules: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub(crate) log_file: Option<PathBuf>,
}
