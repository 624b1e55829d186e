//! The background daemon process.
//!
//! `daemon _serve` lands here. The daemon detaches, takes the lock next to
//! its connection file, binds a fresh address, publishes it, starts the
//! adaptor and serves requests until the lifecycle is cleaned up. A
//! termination signal cancels the lifecycle and wakes the blocked accept by
//! connecting to the daemon's own address.

mod errors;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use adaptor_config::Config;
use adaptor_protocol::{ConnectionInfo, PathMapping, Payload};
use tracing::{debug, info, warn};

use crate::adaptor::AdaptorFactory;
use crate::cancel::CancellationToken;
use crate::dispatch::{Dispatcher, ServeOutcome};
use crate::lifecycle::Lifecycle;
use crate::registry::{AddressAllocator, DaemonLock, SocketDirectories, base_name};
use crate::supervisor::SignalBridge;
use crate::telemetry;
use crate::transport::{AddressNamespace, Transport, for_kind};

pub use errors::DaemonError;

pub(crate) const DAEMON_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::daemon");

/// Keeps `daemon _serve` attached to its terminal when set.
pub const FOREGROUND_ENV: &str = "ADAPTOR_RUNTIME_FOREGROUND";

/// Whether the daemon detaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Start a new session, away from the caller's terminal.
    Background,
    /// Stay attached; used for debugging.
    Foreground,
}

impl LaunchMode {
    fn detect() -> Self {
        if env::var_os(FOREGROUND_ENV).is_some() {
            Self::Foreground
        } else {
            Self::Background
        }
    }
}

/// Arguments of `daemon _serve`.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Where to publish the connection details.
    pub connection_file: PathBuf,
    /// Init data handed to the adaptor factory.
    pub init_data: Payload,
    /// Path mapping rules offered to every callback.
    pub path_mapping: PathMapping,
    /// Diagnostic log destination; stderr when unset.
    pub log_file: Option<PathBuf>,
}

/// Runs a daemon until its lifecycle is cleaned up.
///
/// # Errors
///
/// Fails when the daemon cannot claim its connection file, bind an address
/// or keep accepting connections. Adaptor failures are reported through
/// [`ServeOutcome::clean`] instead.
pub fn run_daemon(
    adaptor_name: &str,
    factory: &AdaptorFactory,
    options: ServeOptions,
    config: &Config,
) -> Result<ServeOutcome, DaemonError> {
    let mode = LaunchMode::detect();
    if mode == LaunchMode::Background {
        detach()?;
    }
    telemetry::initialise(config, options.log_file.as_deref())?;
    let pid = std::process::id();
    info!(target: DAEMON_TARGET, ?mode, pid, adaptor = adaptor_name, "starting daemon");

    let lock = DaemonLock::acquire(&options.connection_file, pid)?;
    let transport = for_kind(config.transport)?;
    let directories = match transport.namespace() {
        AddressNamespace::Filesystem => SocketDirectories::resolve(config.socket_dir.as_deref())?,
        AddressNamespace::Named => SocketDirectories::new(Vec::new()),
    };
    let mut server = AddressAllocator::new(Arc::clone(&transport), directories, pid)
        .bind(&base_name(adaptor_name, &options.connection_file))?;
    let address = server.address().to_owned();

    let token = CancellationToken::new(config.terminate_grace);
    let waker = Waker {
        transport: Arc::clone(&transport),
        address: address.clone(),
        timeout: config.connect_timeout,
    };
    let bridge = {
        let token = token.clone();
        let waker = waker.clone();
        SignalBridge::install(move |_signal| {
            token.cancel();
            waker.wake();
        })?
    };

    lock.publish(&ConnectionInfo::new(transport.kind(), address, pid, now_secs()))?;

    let lifecycle = Lifecycle::new(factory.create(options.init_data), token.clone())
        .with_path_mapping(options.path_mapping);
    let mut dispatcher = Dispatcher::new(lifecycle);
    if !dispatcher.start() {
        linger(token, waker, config.startup_failure_linger);
    }
    let outcome = dispatcher.serve(server.as_mut());
    drop(dispatcher);
    drop(bridge);
    drop(lock);
    drop(server);
    let outcome = outcome?;
    info!(target: DAEMON_TARGET, clean = outcome.clean, "daemon exiting");
    Ok(outcome)
}

#[cfg(unix)]
fn detach() -> Result<(), DaemonError> {
    nix::unistd::setsid().map_err(|errno| DaemonError::Detach {
        source: errno.into(),
    })?;
    Ok(())
}

#[cfg(not(unix))]
fn detach() -> Result<(), DaemonError> {
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Unblocks an accept by connecting to the daemon's own address.
#[derive(Clone)]
struct Waker {
    transport: Arc<dyn Transport>,
    address: String,
    timeout: Duration,
}

impl Waker {
    fn wake(&self) {
        match self.transport.connect(&self.address, self.timeout) {
            Ok(mut connection) => connection.close(),
            Err(error) => debug!(target: DAEMON_TARGET, %error, "wake-up connection failed"),
        }
    }
}

/// Gives a daemon whose start failed a window to receive STOP, then cancels
/// it.
fn linger(token: CancellationToken, waker: Waker, window: Duration) {
    let spawned = thread::Builder::new()
        .name("startup-linger".to_owned())
        .spawn(move || {
            if !token.wait_timeout(window) {
                warn!(
                    target: DAEMON_TARGET,
                    window_ms = window.as_millis(),
                    "no stop request after failed start; shutting down"
                );
                token.cancel();
                waker.wake();
            }
        });
    if let Err(error) = spawned {
        warn!(target: DAEMON_TARGET, %error, "could not schedule shutdown after failed start");
    }
}
