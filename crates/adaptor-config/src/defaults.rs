use std::time::Duration;

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Bound on connecting to a daemon and on each status poll.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a spawned daemon reaching READY.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on a stopped daemon's process exiting before it is killed.
pub const DEFAULT_REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between terminating and killing a canceled subprocess.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// How long a daemon whose start failed waits for a stop request.
pub const DEFAULT_STARTUP_FAILURE_LINGER: Duration = Duration::from_secs(30);
