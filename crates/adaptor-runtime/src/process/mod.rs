//! Subprocesses launched by adaptors, and pid-level process control.

mod managed;
pub mod os;
mod regex_handler;

pub use managed::ManagedProcess;
pub use regex_handler::{RegexCallback, RegexHandler};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");
