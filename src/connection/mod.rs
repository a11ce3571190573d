//! Connection handshake and lifecycle.
//!
//! ```text
//! initiator                         responder
//!    │ ── CONNECT ──────────────────▶ │  create handler     (Connecting)
//!    │ ◀──────────── CHALLENGE(salt) ─│
//!    │ ── CHALLENGE(answer) ────────▶ │  verify answer
//!    │ ◀─────────────────── ACCEPTED ─│  OnConnected        (Connected)
//!    │            ...                 │
//!    │ ── DISCONNECT ───────────────▶ │                     (Disconnected)
//! ```
//!
//! The answer is [`challenge_answer`] over the responder's salt and the
//! initiator's bundle salt.

mod challenge;
#[allow(clippy::module_inception)]
mod connection;
mod event;
mod state;
#[cfg_attr(
    not(any(feature = "client", feature = "server", feature = "discovery")),
    allow(dead_code)
)]
mod worker;

pub use challenge::challenge_answer;
pub use connection::Connection;
pub use event::{ConnectionEvent, DisconnectReason};
pub use state::ConnectionState;
#[cfg_attr(
    not(any(feature = "client", feature = "server", feature = "discovery")),
    allow(unused_imports)
)]
pub(crate) use worker::Worker;
