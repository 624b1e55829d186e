use std::path::PathBuf;

use adaptor_protocol::TransportKind;
use clap::Args;

use crate::{Config, LogFormat};

/// Command-line flags that take precedence over the environment.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOverrides {
    /// Tracing filter, for example `debug` or `adaptor_runtime=trace`.
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_filter: Option<String>,
    /// Diagnostic log format: `json` or `compact`.
    #[arg(long, global = true, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,
    /// IPC transport for new daemons: `pipe` or `socket`.
    #[arg(long, global = true, value_name = "KIND")]
    pub transport: Option<TransportKind>,
    /// Directory that holds daemon sockets.
    #[arg(long, global = true, value_name = "DIR")]
    pub socket_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    pub(crate) fn apply(&self, config: &mut Config) {
        if let Some(filter) = &self.log_filter {
            config.log_filter.clone_from(filter);
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(dir) = &self.socket_dir {
            config.socket_dir = Some(dir.clone());
        }
    }
}
