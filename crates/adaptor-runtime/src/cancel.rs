//! Cooperative cancellation shared by signal handlers, callbacks and
//! supervised subprocesses.
//!
//! A [`CancellationToken`] is a flag plus a registry of live child processes.
//! Cancelling sets the flag, wakes every waiter and asks each registered
//! child to terminate, escalating to a kill once the grace period lapses.
//! Callbacks observe the flag at their own checkpoints.

use std::collections::HashMap;
use std::process::Child;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::process::os;

const CANCEL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::cancel");
const CHILD_POLL: Duration = Duration::from_millis(50);

/// Shared cancellation flag.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
    children: Mutex<Children>,
    terminate_grace: Duration,
}

#[derive(Debug, Default)]
struct Children {
    next_id: u64,
    live: HashMap<u64, Arc<Mutex<Child>>>,
}

impl CancellationToken {
    /// Creates a token whose registered children get `terminate_grace` to
    /// exit after a polite termination request.
    #[must_use]
    pub fn new(terminate_grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: Mutex::new(false),
                wakeup: Condvar::new(),
                children: Mutex::new(Children::default()),
                terminate_grace,
            }),
        }
    }

    /// Requests cancellation. Repeated calls have no further effect.
    pub fn cancel(&self) {
        {
            let mut cancelled = lock(&self.inner.cancelled);
            if *cancelled {
                return;
            }
            *cancelled = true;
        }
        self.inner.wakeup.notify_all();
        let children: Vec<_> = lock(&self.inner.children).live.values().cloned().collect();
        info!(
            target: CANCEL_TARGET,
            children = children.len(),
            "cancellation requested"
        );
        for child in children {
            terminate_child(child, self.inner.terminate_grace);
        }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.cancelled)
    }

    /// Sleeps for up to `timeout`, returning early with `true` when
    /// cancellation is requested.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.inner.cancelled);
        let (guard, _) = self
            .inner
            .wakeup
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Tracks `child` until the returned registration is dropped.
    ///
    /// A child registered after cancellation is terminated straight away.
    pub(crate) fn register_child(&self, child: Arc<Mutex<Child>>) -> ChildRegistration {
        let id = {
            let mut children = lock(&self.inner.children);
            let id = children.next_id;
            children.next_id += 1;
            children.live.insert(id, Arc::clone(&child));
            id
        };
        if self.is_cancelled() {
            terminate_child(child, self.inner.terminate_grace);
        }
        ChildRegistration {
            token: self.clone(),
            id,
        }
    }

    fn unregister(&self, id: u64) {
        lock(&self.inner.children).live.remove(&id);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new(adaptor_config::DEFAULT_TERMINATE_GRACE)
    }
}

/// Keeps a child process registered with a token.
#[derive(Debug)]
pub(crate) struct ChildRegistration {
    token: CancellationToken,
    id: u64,
}

impl Drop for ChildRegistration {
    fn drop(&mut self) {
        self.token.unregister(self.id);
    }
}

/// Sends a polite termination request, then kills the child from a watchdog
/// thread if it is still running once `grace` has elapsed.
pub(crate) fn terminate_child(child: Arc<Mutex<Child>>, grace: Duration) {
    let pid = lock(&child).id();
    if let Err(error) = os::terminate(pid) {
        warn!(target: CANCEL_TARGET, pid, %error, "failed to signal child process");
    }
    let spawned = thread::Builder::new()
        .name(format!("terminate-{pid}"))
        .spawn(move || {
            let deadline = Instant::now() + grace;
            loop {
                {
                    let mut guard = lock(&child);
                    match guard.try_wait() {
                        Ok(Some(_)) => return,
                        Ok(None) if Instant::now() >= deadline => {
                            warn!(
                                target: CANCEL_TARGET,
                                pid,
                                grace_ms = grace.as_millis(),
                                "child ignored termination; killing it"
                            );
                            if let Err(error) = guard.kill() {
                                warn!(target: CANCEL_TARGET, pid, %error, "failed to kill child");
                            }
                            return;
                        }
                        Ok(None) => {}
                        Err(error) => {
                            debug!(target: CANCEL_TARGET, pid, %error, "lost track of child");
                            return;
                        }
                    }
                }
                thread::sleep(CHILD_POLL);
            }
        });
    if let Err(error) = spawned {
        warn!(target: CANCEL_TARGET, pid, %error, "failed to start termination watchdog");
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
