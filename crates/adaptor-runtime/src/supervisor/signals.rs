//! Bridges OS termination signals to a callback.

use std::io;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use super::ProcessError;
use crate::process::PROCESS_TARGET;

/// Routes interrupt and terminate signals to a handler for as long as it
/// lives. Default termination is suppressed while installed.
pub struct SignalBridge {
    inner: Option<Inner>,
}

#[cfg(unix)]
struct Inner {
    handle: signal_hook::iterator::Handle,
    thread: JoinHandle<()>,
}

#[cfg(not(unix))]
struct Inner {
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    thread: JoinHandle<()>,
}

impl SignalBridge {
    /// Installs handlers that call `on_signal` with each signal number.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Signal`] when the handlers cannot be
    /// registered.
    #[cfg(unix)]
    pub fn install<F>(on_signal: F) -> Result<Self, ProcessError>
    where
        F: Fn(i32) + Send + 'static,
    {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT, SIGHUP])
            .map_err(|source| ProcessError::Signal { source })?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("signal-bridge".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    info!(target: PROCESS_TARGET, signal, "termination signal received");
                    on_signal(signal);
                }
            })
            .map_err(|source| ProcessError::Signal { source })?;
        Ok(Self {
            inner: Some(Inner { handle, thread }),
        })
    }

    /// Installs handlers that call `on_signal` with each signal number.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Signal`] when the handlers cannot be
    /// registered.
    #[cfg(not(unix))]
    pub fn install<F>(on_signal: F) -> Result<Self, ProcessError>
    where
        F: Fn(i32) + Send + 'static,
    {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let interrupted = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGINT, Arc::clone(&interrupted))
            .and_then(|_| signal_hook::flag::register(SIGTERM, Arc::clone(&terminated)))
            .map_err(|source| ProcessError::Signal { source })?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("signal-bridge".to_owned())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    for (flag, signal) in [(&interrupted, SIGINT), (&terminated, SIGTERM)] {
                        if flag.swap(false, Ordering::SeqCst) {
                            info!(target: PROCESS_TARGET, signal, "termination signal received");
                            on_signal(signal);
                        }
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            })
            .map_err(|source| ProcessError::Signal { source })?;
        Ok(Self {
            inner: Some(Inner { stop, thread }),
        })
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        #[cfg(unix)]
        inner.handle.close();
        #[cfg(not(unix))]
        inner.stop.store(true, std::sync::atomic::Ordering::SeqCst);
        if inner.thread.join().is_err() {
            warn!(target: PROCESS_TARGET, "signal bridge thread panicked");
        } else {
            debug!(target: PROCESS_TARGET, "signal bridge removed");
        }
    }
}

/// Reports why a signal could not be forwarded, without failing.
pub(crate) fn log_forward_failure(pid: u32, error: &io::Error) {
    warn!(target: PROCESS_TARGET, pid, %error, "failed to forward signal to daemon");
}
