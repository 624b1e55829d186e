//! Runtime for adaptors that wrap long-lived applications.
//!
//! An adaptor implements [`Adaptor`] and exposes its command line through
//! [`EntryPoint`]. The runtime can then drive it two ways:
//!
//! - in the foreground, where `run` executes start, one unit of work, stop
//!   and cleanup in a single process;
//! - as a background daemon, where `daemon start` keeps the application
//!   loaded, `daemon run` sends work to it over local IPC with output
//!   streamed back live, and `daemon stop` tears it down.
//!
//! Adaptors that only launch one command per run can implement
//! [`CommandAdaptor`] instead. Every callback can rewrite paths with the
//! [`PathMapping`] rules given at start through
//! [`CallbackContext::map_path`]. Adaptors that drive an application
//! through a client running inside it hand it work over an
//! [`application::ApplicationServer`].
//!
//! The daemon publishes how to reach it in a connection file. Clients
//! connect over a length-prefixed framed transport or HTTP on a Unix
//! domain socket; both carry the frames defined in [`adaptor_protocol`].

mod adaptor;
pub mod application;
mod cancel;
mod cli;
mod command;
pub mod daemon;
pub mod dispatch;
mod foreground;
pub mod lifecycle;
mod output;
pub mod process;
pub mod registry;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use adaptor::{
    Adaptor, AdaptorError, AdaptorFactory, CallbackContext, FAIL_PREFIX, PROGRESS_PREFIX,
    STATUS_PREFIX,
};
pub use adaptor_protocol::{PathFormat, PathMapping, PathMappingRule, Payload};
pub use cancel::CancellationToken;
pub use cli::{EntryPoint, PayloadError};
pub use command::{CommandAdaptor, CommandRunner};
pub use foreground::run_foreground;
pub use output::{ChannelSink, LogSink, OutputWriter, SharedSink, TracingSink};
pub use process::{ManagedProcess, RegexCallback, RegexHandler};
pub use supervisor::{SignalBridge, StopOutcome, Supervisor};
