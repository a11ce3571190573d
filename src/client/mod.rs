//! Client side of a connection.
//!
//! High-level API for connecting to a server.

#[allow(clippy::module_inception)]
mod client;

pub use client::*;
