use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Phases of an adaptor's lifecycle.
///
/// Variants are declared in lifecycle order. Every permitted transition moves
/// forward through that order except `Running -> Ready`, which lets a daemon
/// serve any number of runs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing has been invoked yet.
    NotStarted,
    /// `on_start` is executing.
    Starting,
    /// Started and idle.
    Ready,
    /// `on_run` is executing.
    Running,
    /// Cancellation was observed, or start failed.
    Canceled,
    /// `on_stop` is executing.
    Stopping,
    /// `on_stop` returned and cleanup is pending.
    Stopped,
    /// `on_cleanup` returned. No further transition is possible.
    CleanedUp,
}

impl LifecycleState {
    /// Whether the machine may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Starting)
                | (Self::Starting, Self::Ready | Self::Canceled)
                | (
                    Self::Ready,
                    Self::Running | Self::Canceled | Self::Stopping
                )
                | (Self::Running, Self::Ready | Self::Canceled)
                | (Self::Canceled, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
                | (Self::Stopped, Self::CleanedUp)
        )
    }

    /// Whether a stop request may be serviced in this state.
    #[must_use]
    pub const fn accepts_stop(self) -> bool {
        matches!(self, Self::Ready | Self::Canceled)
    }

    /// Whether the lifecycle has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::CleanedUp)
    }
}
