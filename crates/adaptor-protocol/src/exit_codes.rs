//! Process exit codes reserved by the runtime.
//!
//! Codes below 64 describe what happened inside the adaptor. Codes from 64
//! upward follow `sysexits.h` and describe failures reaching the daemon.

/// The request completed successfully.
pub const SUCCESS: u8 = 0;
/// An adaptor callback returned an error.
pub const CALLBACK_FAILED: u8 = 1;
/// The request was not valid for the daemon's lifecycle state.
pub const INVALID_TRANSITION: u8 = 2;
/// The work was interrupted by a cancellation signal.
pub const CANCELED: u8 = 3;
/// Command-line usage error.
pub const USAGE: u8 = 64;
/// The connection file exists but cannot be parsed.
pub const CONNECTION_FILE_CORRUPT: u8 = 65;
/// The connection file does not exist.
pub const CONNECTION_FILE_NOT_FOUND: u8 = 66;
/// No daemon is listening at the recorded address.
pub const CONNECTION_REFUSED: u8 = 69;
/// The daemon could not be started or failed while starting.
pub const STARTUP_FAILED: u8 = 70;
/// The daemon address is held by another live daemon or none could be found.
pub const ADDRESS_UNAVAILABLE: u8 = 71;
/// A bounded wait expired.
pub const TIMEOUT: u8 = 75;
/// The peer violated the wire protocol.
pub const PROTOCOL: u8 = 76;
