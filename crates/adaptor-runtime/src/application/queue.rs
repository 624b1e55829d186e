//! Actions waiting for the application to pick them up.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use adaptor_protocol::Payload;
use serde::{Deserialize, Serialize};

use crate::cancel::lock;

/// One instruction for the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppAction {
    /// What the application should do.
    pub name: String,
    /// Arguments for the action, when it takes any.
    #[serde(default)]
    pub args: Option<Payload>,
}

impl AppAction {
    /// An action without arguments.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: None,
        }
    }

    /// Attaches `args` to the action.
    #[must_use]
    pub fn with_args(mut self, args: Payload) -> Self {
        self.args = Some(args);
        self
    }
}

/// A first-in first-out queue of [`AppAction`]s shared between the adaptor
/// and an [`ApplicationServer`](super::ApplicationServer).
///
/// Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct ActionsQueue {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    actions: Mutex<VecDeque<AppAction>>,
    arrived: Condvar,
}

impl ActionsQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `action` behind everything already queued.
    pub fn enqueue(&self, action: AppAction) {
        lock(&self.shared.actions).push_back(action);
        self.shared.arrived.notify_one();
    }

    /// Puts `action` ahead of everything already queued.
    pub fn enqueue_front(&self, action: AppAction) {
        lock(&self.shared.actions).push_front(action);
        self.shared.arrived.notify_one();
    }

    /// Removes and returns the oldest action, if any.
    #[must_use]
    pub fn dequeue(&self) -> Option<AppAction> {
        lock(&self.shared.actions).pop_front()
    }

    /// Waits up to `timeout` for an action and removes it.
    #[must_use]
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<AppAction> {
        let deadline = Instant::now() + timeout;
        let mut actions = lock(&self.shared.actions);
        loop {
            if let Some(action) = actions.pop_front() {
                return Some(action);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            actions = self
                .shared
                .arrived
                .wait_timeout(actions, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Number of queued actions.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.shared.actions).len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.shared.actions).is_empty()
    }
}
