//! Events a connection reports to its owner.

use std::fmt;

use crate::segment::PooledSegment;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// This side called `disconnect` or `release`.
    Local,
    /// The peer sent DISCONNECT.
    Remote,
    /// A reliable segment ran out of retransmissions.
    MaxRetries,
    /// The socket failed.
    SocketError,
    /// The handshake was not answered in time.
    HandshakeTimeout,
    /// The server has no free client slot.
    ServerFull,
    /// The server is not accepting connections.
    ServerNotAccepting,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Local => "disconnected locally",
            DisconnectReason::Remote => "disconnected by peer",
            DisconnectReason::MaxRetries => "reliable segment exceeded max retries",
            DisconnectReason::SocketError => "socket error",
            DisconnectReason::HandshakeTimeout => "handshake timed out",
            DisconnectReason::ServerFull => "server full",
            DisconnectReason::ServerNotAccepting => "server not accepting connections",
        };
        f.write_str(text)
    }
}

/// Event reported by a client connection.
///
/// Received segments are owned by the event; dropping it returns the
/// segment to its pool.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The handshake completed.
    Connected,
    /// An application segment arrived, in delivery order.
    Received(PooledSegment),
    /// The connection started closing.
    Disconnecting(DisconnectReason),
    /// The connection closed.
    Disconnected(DisconnectReason),
}
