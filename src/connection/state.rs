//! Connection lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Connection lifecycle state.
///
/// States only move forward: a connection never returns to an earlier
/// state, and `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Handshake complete, application traffic flows.
    Connected,
    /// Disconnect started, notice may still be in flight.
    Disconnecting,
    /// Connection closed.
    Disconnected,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Check if the handshake has completed and the connection is open.
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Check if the connection has started or finished closing.
    pub fn is_closing(self) -> bool {
        self >= ConnectionState::Disconnecting
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Atomic holder of a [`ConnectionState`] that only advances.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if it is later than the current state.
    ///
    /// Returns `true` for the one caller that made the transition.
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok()
    }
}
