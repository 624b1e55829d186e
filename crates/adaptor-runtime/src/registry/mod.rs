//! Where a daemon can be reached.
//!
//! A daemon allocates a unique address, takes the lock next to its
//! connection file and then publishes [`adaptor_protocol::ConnectionInfo`].
//! Clients read the file to connect, and whoever observes the daemon gone
//! invalidates it.

mod address;
mod errors;
mod files;
mod lock;

pub use address::{AddressAllocator, MAX_ADDRESS_ATTEMPTS, SocketDirectories, base_name};
pub use errors::RegistryError;
pub use files::{invalidate, read_connection_file, write_connection_file};
pub use lock::DaemonLock;

pub(crate) const REGISTRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::registry");
