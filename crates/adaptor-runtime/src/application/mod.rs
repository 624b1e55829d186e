//! A channel between an adaptor and the application it drives.
//!
//! The adaptor queues [`AppAction`]s on an [`ActionsQueue`]. A client
//! running inside the application polls an [`ApplicationServer`] on a Unix
//! domain socket for the next action, and asks it to map paths with the
//! rules the adaptor was started with:
//!
//! - `GET /action` waits for the next queued action and returns it as JSON;
//! - `GET /path_mapping?path=<path>` returns `{"path": <mapped>}`;
//! - `GET /path_mapping_rules` returns `{"path_mapping_rules": [...]}`.
//!
//! [`ApplicationClient`] is the application's side of that exchange.

mod queue;
#[cfg(unix)]
mod server;

pub use queue::{ActionsQueue, AppAction};
#[cfg(unix)]
pub use server::{ApplicationClient, ApplicationError, ApplicationServer};

const APPLICATION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::application");
