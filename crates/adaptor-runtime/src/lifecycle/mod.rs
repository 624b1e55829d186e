//! The adaptor lifecycle shared by foreground and daemon execution.
//!
//! [`Lifecycle`] owns the adaptor and is the only thing that calls its
//! callbacks. It enforces the transition table from
//! [`LifecycleState::can_transition_to`] and guarantees that once started,
//! `on_stop` and `on_cleanup` each run exactly once, whatever failed or was
//! canceled on the way. Cancellation arrives asynchronously through the
//! [`CancellationToken`] and is acknowledged here, on the owning thread, at
//! the next checkpoint.

mod errors;


use std::sync::Arc;

use adaptor_protocol::{ErrorReport, LifecycleState, OutputStream, PathMapping, Payload};
use tracing::{debug, info, warn};

pub use errors::{LifecycleError, Phase};

use crate::adaptor::{Adaptor, AdaptorError, CallbackContext, FAIL_PREFIX};
use crate::cancel::CancellationToken;
use crate::output::{SharedSink, TracingSink};

pub(crate) const LIFECYCLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lifecycle");

/// An adaptor and the state of its lifecycle.
pub struct Lifecycle {
    adaptor: Box<dyn Adaptor>,
    state: LifecycleState,
    token: CancellationToken,
    path_mapping: Arc<PathMapping>,
    cancel_acknowledged: bool,
    stopped: bool,
    cleaned: bool,
    start_error: Option<ErrorReport>,
}

impl Lifecycle {
    /// Wraps an adaptor that has not been started.
    #[must_use]
    pub fn new(adaptor: Box<dyn Adaptor>, token: CancellationToken) -> Self {
        Self {
            adaptor,
            state: LifecycleState::NotStarted,
            token,
            path_mapping: Arc::default(),
            cancel_acknowledged: false,
            stopped: false,
            cleaned: false,
            start_error: None,
        }
    }

    /// Makes `path_mapping` available to every callback.
    #[must_use]
    pub fn with_path_mapping(mut self, path_mapping: PathMapping) -> Self {
        self.path_mapping = Arc::new(path_mapping);
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Token observed by every callback.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why start failed, if it did.
    #[must_use]
    pub const fn start_error(&self) -> Option<&ErrorReport> {
        self.start_error.as_ref()
    }

    fn transition(&mut self, to: LifecycleState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(target: LIFECYCLE_TARGET, from = %self.state, %to, "lifecycle transition");
        self.state = to;
        Ok(())
    }

    fn context(&self, sink: &SharedSink) -> CallbackContext {
        CallbackContext::new(Arc::clone(sink), self.token.clone())
            .with_path_mapping(Arc::clone(&self.path_mapping))
    }

    fn callback_failed(phase: Phase, source: AdaptorError, ctx: &CallbackContext) -> LifecycleError {
        warn!(target: LIFECYCLE_TARGET, %phase, error = %source, "callback failed");
        ctx.emit(OutputStream::Stderr, format!("{FAIL_PREFIX}{source}\n"));
        LifecycleError::Callback { phase, source }
    }

    /// Runs `on_start`, leaving the lifecycle READY on success.
    ///
    /// A failed start leaves the lifecycle CANCELED: no run is accepted but
    /// stop and cleanup still happen.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] unless the lifecycle is
    /// NOT_STARTED, [`LifecycleError::Callback`] when `on_start` fails and
    /// [`LifecycleError::Canceled`] when cancellation interrupted it.
    pub fn start(&mut self, sink: &SharedSink) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Starting)?;
        let ctx = self.context(sink);
        let outcome = if self.token.is_cancelled() {
            Err(AdaptorError::Canceled)
        } else {
            self.adaptor.on_start(&ctx)
        };
        let error = match outcome {
            Ok(()) if !self.token.is_cancelled() => {
                self.transition(LifecycleState::Ready)?;
                info!(target: LIFECYCLE_TARGET, "adaptor started");
                return Ok(());
            }
            Ok(()) | Err(AdaptorError::Canceled) => LifecycleError::Canceled { phase: Phase::Start },
            Err(source) if self.token.is_cancelled() => {
                debug!(target: LIFECYCLE_TARGET, error = %source, "start failed after cancellation");
                LifecycleError::Canceled { phase: Phase::Start }
            }
            Err(source) => Self::callback_failed(Phase::Start, source, &ctx),
        };
        self.transition(LifecycleState::Canceled)?;
        self.start_error = Some(error.to_report());
        if self.token.is_cancelled() {
            if let Err(cancel_error) = self.acknowledge_cancel(sink) {
                warn!(target: LIFECYCLE_TARGET, error = %cancel_error, "cancel callback failed");
            }
        }
        Err(error)
    }

    /// Runs `on_run` with `payload`, returning to READY afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] unless the lifecycle is
    /// READY, [`LifecycleError::Callback`] when `on_run` fails (the
    /// lifecycle stays usable) and [`LifecycleError::Canceled`] when
    /// cancellation was requested before or during the run (the lifecycle is
    /// then CANCELED).
    pub fn run(&mut self, payload: &Payload, sink: &SharedSink) -> Result<(), LifecycleError> {
        if self.token.is_cancelled() {
            self.acknowledge_cancel(sink)?;
            return Err(LifecycleError::Canceled { phase: Phase::Run });
        }
        self.transition(LifecycleState::Running)?;
        let ctx = self.context(sink);
        let outcome = self.adaptor.on_run(payload, &ctx);
        if self.token.is_cancelled() {
            if let Err(error) = &outcome {
                debug!(target: LIFECYCLE_TARGET, %error, "run ended by cancellation");
            }
            if let Err(error) = self.acknowledge_cancel(sink) {
                warn!(target: LIFECYCLE_TARGET, %error, "cancel callback failed");
            }
            return Err(LifecycleError::Canceled { phase: Phase::Run });
        }
        self.transition(LifecycleState::Ready)?;
        match outcome {
            Ok(()) => Ok(()),
            Err(AdaptorError::Canceled) => Err(LifecycleError::Canceled { phase: Phase::Run }),
            Err(source) => Err(Self::callback_failed(Phase::Run, source, &ctx)),
        }
    }

    /// Moves to CANCELED and calls `on_cancel`, at most once.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Callback`] when `on_cancel` fails.
    pub fn acknowledge_cancel(&mut self, sink: &SharedSink) -> Result<(), LifecycleError> {
        if self.cancel_acknowledged {
            return Ok(());
        }
        match self.state {
            LifecycleState::Starting | LifecycleState::Ready | LifecycleState::Running => {
                self.transition(LifecycleState::Canceled)?;
            }
            LifecycleState::Canceled => {}
            LifecycleState::NotStarted
            | LifecycleState::Stopping
            | LifecycleState::Stopped
            | LifecycleState::CleanedUp => return Ok(()),
        }
        self.cancel_acknowledged = true;
        info!(target: LIFECYCLE_TARGET, "cancellation acknowledged");
        let ctx = self.context(sink);
        self.adaptor
            .on_cancel(&ctx)
            .map_err(|source| Self::callback_failed(Phase::Cancel, source, &ctx))
    }

    /// Runs `on_stop` then `on_cleanup`, ending CLEANED_UP.
    ///
    /// Cleanup runs even when `on_stop` fails.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] unless the lifecycle is
    /// READY or CANCELED, otherwise the first callback failure.
    pub fn shutdown(&mut self, sink: &SharedSink) -> Result<(), LifecycleError> {
        if !self.state.accepts_stop() {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to: LifecycleState::Stopping,
            });
        }
        self.transition(LifecycleState::Stopping)?;
        self.finish(sink)
    }

    fn finish(&mut self, sink: &SharedSink) -> Result<(), LifecycleError> {
        let ctx = self.context(sink);
        let mut first_error = None;
        if !self.stopped {
            self.stopped = true;
            if let Err(source) = self.adaptor.on_stop(&ctx) {
                first_error.get_or_insert(Self::callback_failed(Phase::Stop, source, &ctx));
            }
        }
        if self.state == LifecycleState::Stopping {
            self.transition(LifecycleState::Stopped)?;
        }
        if !self.cleaned {
            self.cleaned = true;
            if let Err(source) = self.adaptor.on_cleanup(&ctx) {
                first_error.get_or_insert(Self::callback_failed(Phase::Cleanup, source, &ctx));
            }
        }
        if self.state == LifecycleState::Stopped {
            self.transition(LifecycleState::CleanedUp)?;
        }
        info!(target: LIFECYCLE_TARGET, "adaptor stopped and cleaned up");
        first_error.map_or(Ok(()), Err)
    }

    /// Brings the lifecycle to CLEANED_UP from wherever it is.
    ///
    /// Acknowledges a pending cancellation first. Does nothing when the
    /// adaptor never started or is already cleaned up.
    ///
    /// # Errors
    ///
    /// Returns the first callback failure.
    pub fn teardown(&mut self, sink: &SharedSink) -> Result<(), LifecycleError> {
        let mut first_error = None;
        if self.token.is_cancelled() {
            if let Err(error) = self.acknowledge_cancel(sink) {
                first_error = Some(error);
            }
        }
        let outcome = match self.state {
            LifecycleState::NotStarted | LifecycleState::CleanedUp => Ok(()),
            LifecycleState::Ready | LifecycleState::Canceled => self.shutdown(sink),
            LifecycleState::Starting | LifecycleState::Running => self
                .transition(LifecycleState::Canceled)
                .and_then(|()| self.shutdown(sink)),
            LifecycleState::Stopping | LifecycleState::Stopped => self.finish(sink),
        };
        match (first_error, outcome) {
            (Some(error), _) | (None, Err(error)) => Err(error),
            (None, Ok(())) => Ok(()),
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if matches!(
            self.state,
            LifecycleState::NotStarted | LifecycleState::CleanedUp
        ) {
            return;
        }
        warn!(target: LIFECYCLE_TARGET, state = %self.state, "lifecycle dropped before teardown");
        let sink: SharedSink = Arc::new(TracingSink);
        if let Err(error) = self.teardown(&sink) {
            warn!(target: LIFECYCLE_TARGET, %error, "teardown on drop failed");
        }
    }
}
