//! Environment-backed configuration layer.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Config, ConfigError};

/// Tracing filter directive.
pub const LOG_FILTER_ENV: &str = "ADAPTOR_RUNTIME_LOG_FILTER";
/// `json` or `compact`.
pub const LOG_FORMAT_ENV: &str = "ADAPTOR_RUNTIME_LOG_FORMAT";
/// `pipe` or `socket`.
pub const TRANSPORT_ENV: &str = "ADAPTOR_RUNTIME_TRANSPORT";
/// Directory for daemon sockets.
pub const SOCKET_DIR_ENV: &str = "ADAPTOR_RUNTIME_SOCKET_DIR";
/// Connect and status poll timeout in milliseconds.
pub const CONNECT_TIMEOUT_ENV: &str = "ADAPTOR_RUNTIME_CONNECT_TIMEOUT_MS";
/// Startup timeout in milliseconds.
pub const STARTUP_TIMEOUT_ENV: &str = "ADAPTOR_RUNTIME_STARTUP_TIMEOUT_MS";
/// Reap timeout in milliseconds.
pub const REAP_TIMEOUT_ENV: &str = "ADAPTOR_RUNTIME_REAP_TIMEOUT_MS";
/// Subprocess terminate grace in milliseconds.
pub const TERMINATE_GRACE_ENV: &str = "ADAPTOR_RUNTIME_TERMINATE_GRACE_MS";
/// Failed-start linger in milliseconds.
pub const STARTUP_LINGER_ENV: &str = "ADAPTOR_RUNTIME_STARTUP_LINGER_MS";

/// Source of configuration variables.
///
/// The process environment is the production source; tests supply a map.
pub trait EnvSource {
    /// Returns the value of `key`, if set.
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads variables from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl<S: BuildHasher> EnvSource for HashMap<String, String, S> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

pub(crate) fn apply(config: &mut Config, env: &dyn EnvSource) -> Result<(), ConfigError> {
    if let Some(filter) = non_empty(env, LOG_FILTER_ENV) {
        config.log_filter = filter;
    }
    if let Some(format) = parsed(env, LOG_FORMAT_ENV)? {
        config.log_format = format;
    }
    if let Some(transport) = parsed(env, TRANSPORT_ENV)? {
        config.transport = transport;
    }
    if let Some(dir) = non_empty(env, SOCKET_DIR_ENV) {
        config.socket_dir = Some(PathBuf::from(dir));
    }
    if let Some(timeout) = millis(env, CONNECT_TIMEOUT_ENV)? {
        config.connect_timeout = timeout;
    }
    if let Some(timeout) = millis(env, STARTUP_TIMEOUT_ENV)? {
        config.startup_timeout = timeout;
    }
    if let Some(timeout) = millis(env, REAP_TIMEOUT_ENV)? {
        config.reap_timeout = timeout;
    }
    if let Some(grace) = millis(env, TERMINATE_GRACE_ENV)? {
        config.terminate_grace = grace;
    }
    if let Some(linger) = millis(env, STARTUP_LINGER_ENV)? {
        config.startup_failure_linger = linger;
    }
    Ok(())
}

fn non_empty(env: &dyn EnvSource, key: &str) -> Option<String> {
    env.var(key).filter(|value| !value.trim().is_empty())
}

fn parsed<T>(env: &dyn EnvSource, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = non_empty(env, key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|error| ConfigError::InvalidValue {
            variable: key,
            value: raw.clone(),
            reason: error.to_string(),
        })
}

fn millis(env: &dyn EnvSource, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = parsed::<u64>(env, key)? else {
        return Ok(None);
    };
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            variable: key,
            value: value.to_string(),
            reason: "must be greater than zero".to_owned(),
        });
    }
    Ok(Some(Duration::from_millis(value)))
}
