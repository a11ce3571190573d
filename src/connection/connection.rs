//! Per-peer connection state.

use std::net::SocketAddr;

use tracing::{info, warn};

use super::event::DisconnectReason;
use super::state::{ConnectionState, StateCell};
use crate::core::TransportContext;
use crate::segment::{BinaryEncoder, SegmentType};
use crate::transport::{NetworkStatistics, PacketManager, PacketManagerConfig};

/// One end of a connection: the handshake state and the packet manager
/// that talks to the remote endpoint.
#[derive(Debug)]
pub struct Connection {
    manager: PacketManager,
    state: StateCell,
}

impl Connection {
    pub(crate) fn new(
        config: PacketManagerConfig,
        context: TransportContext,
        endpoint: SocketAddr,
    ) -> Self {
        Self {
            manager: PacketManager::new(config, context, endpoint),
            state: StateCell::new(ConnectionState::Connecting),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Remote endpoint.
    pub fn endpoint(&self) -> SocketAddr {
        self.manager.endpoint()
    }

    /// The packet manager for this peer.
    pub fn manager(&self) -> &PacketManager {
        &self.manager
    }

    /// Connection statistics.
    pub fn statistics(&self) -> &NetworkStatistics {
        self.manager.statistics()
    }

    /// Move to `Connected`. Returns `true` the first time only.
    pub(crate) fn mark_connected(&self) -> bool {
        let connected = self.state.advance(ConnectionState::Connected);
        if connected {
            info!(endpoint = %self.endpoint(), "connected");
        }
        connected
    }

    /// Queue a handshake or control segment on the unreliable path.
    pub(crate) fn send_control<F>(&self, segment_type: SegmentType, fill: F) -> bool
    where
        F: FnOnce(&mut BinaryEncoder<'_>),
    {
        let Some(mut segment) = self.manager.request_segment(segment_type) else {
            warn!(endpoint = %self.endpoint(), %segment_type, "no free segment for control message");
            return false;
        };
        fill(&mut BinaryEncoder::new(&mut segment));
        self.manager.enqueue_segment_unreliable(segment);
        true
    }

    /// Run the disconnect protocol once.
    ///
    /// Moves through `Disconnecting` to `Disconnected`, queueing a
    /// DISCONNECT for the peer when `notify_peer` is set. Returns `false`
    /// if the connection was already closing.
    pub(crate) fn close(&self, reason: DisconnectReason, notify_peer: bool) -> bool {
        if !self.state.advance(ConnectionState::Disconnecting) {
            return false;
        }
        if notify_peer {
            self.send_control(SegmentType::DISCONNECT, |_| {});
        }
        self.state.advance(ConnectionState::Disconnected);
        info!(endpoint = %self.endpoint(), %reason, "disconnected");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        Connection::new(
            PacketManagerConfig::default().with_pool_size(4),
            TransportContext::new(),
            "127.0.0.1:9000".parse().unwrap(),
        )
    }

    #[test]
    fn test_close_runs_once() {
        let connection = connection();
        assert!(connection.mark_connected());
        assert!(!connection.mark_connected());

        assert!(connection.close(DisconnectReason::Local, true));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.manager().has_pending_output());

        assert!(!connection.close(DisconnectReason::Local, true));
        assert!(!connection.close(DisconnectReason::Remote, false));
        assert!(!connection.mark_connected());
    }

    #[test]
    fn test_remote_close_sends_nothing() {
        let connection = connection();
        assert!(connection.close(DisconnectReason::Remote, false));
        assert!(!connection.manager().has_pending_output());
    }

    #[test]
    fn test_control_segment_needs_a_free_slot() {
        let connection = connection();
        let held: Vec<_> = (0..4)
            .map(|_| connection.manager().request_segment(SegmentType::PING).unwrap())
            .collect();
        assert!(!connection.send_control(SegmentType::PING, |_| {}));
        drop(held);
        assert!(connection.send_control(SegmentType::PING, |e| {
            e.write_u8(1);
        }));
    }
}
