//! Failures of lifecycle transitions and callbacks.

use adaptor_protocol::{ErrorKind, ErrorReport, LifecycleState};
use strum::Display;
use thiserror::Error;

use crate::adaptor::AdaptorError;

/// Callback phase in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// `on_start`.
    Start,
    /// `on_run`.
    Run,
    /// `on_cancel`.
    Cancel,
    /// `on_stop`.
    Stop,
    /// `on_cleanup`.
    Cleanup,
}

/// Errors raised while driving an adaptor through its lifecycle.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The requested operation is not allowed in the current state.
    #[error("cannot move from {from} to {to}")]
    InvalidTransition {
        /// State the machine is in.
        from: LifecycleState,
        /// State the operation would have entered.
        to: LifecycleState,
    },
    /// An adaptor callback returned an error.
    #[error("{phase} callback failed: {source}")]
    Callback {
        /// Callback that failed.
        phase: Phase,
        /// The adaptor's error.
        #[source]
        source: AdaptorError,
    },
    /// Cancellation interrupted the operation.
    #[error("{phase} was canceled")]
    Canceled {
        /// Callback that was running.
        phase: Phase,
    },
}

impl LifecycleError {
    /// Wire form of this error.
    #[must_use]
    pub fn to_report(&self) -> ErrorReport {
        let kind = match self {
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Callback { .. } => ErrorKind::Callback,
            Self::Canceled { .. } => ErrorKind::Canceled,
        };
        ErrorReport::new(kind, self.to_string())
    }

    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        self.to_report().kind.exit_code()
    }
}
