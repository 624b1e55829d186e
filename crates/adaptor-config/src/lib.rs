//! Configuration shared by adaptor runtime clients and daemons.
//!
//! Values are layered: built-in defaults, then `ADAPTOR_RUNTIME_*`
//! environment variables, then command-line flags. A supervisor hands its
//! resolved configuration to the daemon it spawns through
//! [`Config::to_env`], so both processes agree on transport, socket
//! directory and timeouts.

mod defaults;
mod env;
mod logging;
mod overrides;

use std::path::PathBuf;
use std::time::Duration;

use adaptor_protocol::TransportKind;
use thiserror::Error;

pub use defaults::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_LOG_FILTER, DEFAULT_REAP_TIMEOUT,
    DEFAULT_STARTUP_FAILURE_LINGER, DEFAULT_STARTUP_TIMEOUT, DEFAULT_TERMINATE_GRACE,
};
pub use env::{
    CONNECT_TIMEOUT_ENV, EnvSource, LOG_FILTER_ENV, LOG_FORMAT_ENV, ProcessEnv, REAP_TIMEOUT_ENV,
    SOCKET_DIR_ENV, STARTUP_LINGER_ENV, STARTUP_TIMEOUT_ENV, TERMINATE_GRACE_ENV, TRANSPORT_ENV,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use overrides::ConfigOverrides;

/// Resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Tracing filter directive.
    pub log_filter: String,
    /// Diagnostic log format.
    pub log_format: LogFormat,
    /// Transport used by daemons started with this configuration.
    pub transport: TransportKind,
    /// Directory for daemon sockets; resolved per platform when unset.
    pub socket_dir: Option<PathBuf>,
    /// Bound on connecting to a daemon and on each status poll.
    pub connect_timeout: Duration,
    /// Bound on a spawned daemon reaching READY.
    pub startup_timeout: Duration,
    /// Bound on a stopped daemon's process exiting before it is killed.
    pub reap_timeout: Duration,
    /// Delay between terminating and killing a canceled subprocess.
    pub terminate_grace: Duration,
    /// How long a daemon whose start failed waits for a stop request.
    pub startup_failure_linger: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
            log_format: LogFormat::default(),
            transport: TransportKind::platform_default(),
            socket_dir: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            reap_timeout: DEFAULT_REAP_TIMEOUT,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            startup_failure_linger: DEFAULT_STARTUP_FAILURE_LINGER,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment and `overrides`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a variable cannot be parsed.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        Self::load_from(&ProcessEnv, overrides)
    }

    /// Loads configuration from an explicit variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a variable cannot be parsed.
    pub fn load_from(env: &dyn EnvSource, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        env::apply(&mut config, env)?;
        overrides.apply(&mut config);
        Ok(config)
    }

    /// Tracing filter directive.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Diagnostic log format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Environment variables reproducing this configuration in a child.
    #[must_use]
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (LOG_FILTER_ENV, self.log_filter.clone()),
            (LOG_FORMAT_ENV, self.log_format.to_string()),
            (TRANSPORT_ENV, self.transport.to_string()),
            (CONNECT_TIMEOUT_ENV, millis(self.connect_timeout)),
            (STARTUP_TIMEOUT_ENV, millis(self.startup_timeout)),
            (REAP_TIMEOUT_ENV, millis(self.reap_timeout)),
            (TERMINATE_GRACE_ENV, millis(self.terminate_grace)),
            (STARTUP_LINGER_ENV, millis(self.startup_failure_linger)),
        ];
        if let Some(dir) = &self.socket_dir {
            vars.push((SOCKET_DIR_ENV, dir.display().to_string()));
        }
        vars
    }
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable held a value that could not be used.
    #[error("invalid value '{value}' for {variable}: {reason}")]
    InvalidValue {
        /// Name of the offending variable.
        variable: &'static str,
        /// Raw value found.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}
