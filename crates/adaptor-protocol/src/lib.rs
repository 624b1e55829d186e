//! Wire types shared by adaptor runtime clients and daemons.
//!
//! Both transports carry the same [`Frame`] values and only differ in how a
//! frame is delimited on the wire. The connection file contents
//! ([`ConnectionInfo`]) and the reserved process exit codes live here too so
//! the client and the daemon can never disagree about them, as do the
//! [`PathMapping`] rules a daemon is started with.

mod connection;
pub mod exit_codes;
mod frame;
mod path_mapping;
mod state;

pub use connection::{ConnectionInfo, TransportKind};
pub use frame::{
    Action, ErrorKind, ErrorReport, Frame, LogRecord, OutputStream, Payload, Request, Response,
    ResponseStatus,
};
pub use path_mapping::{PathFormat, PathMapping, PathMappingError, PathMappingRule};
pub use state::LifecycleState;
