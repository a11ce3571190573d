//! Server side of a connection.
//!
//! [`Server`] admits clients up to a limit, answers their handshakes and
//! multiplexes every [`RemoteClient`] over one socket.

mod remote;
#[allow(clippy::module_inception)]
mod server;

pub use remote::RemoteClient;
pub use server::*;
