//! Server-side handler for one client.

use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionState, challenge_answer};
use crate::core::TransportContext;
use crate::segment::{BinaryDecoder, Segment, SegmentType};
use crate::transport::{NetworkStatistics, PacketManagerConfig};

/// Result of checking a challenge answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnswerOutcome {
    /// The answer matched and ACCEPTED was queued.
    Accepted {
        /// This answer completed the handshake.
        first: bool,
    },
    /// The answer did not match; state is unchanged.
    Rejected,
    /// The connection is already closing.
    Ignored,
}

/// The responder end of a connection, created when a CONNECT arrives
/// from an unknown endpoint.
#[derive(Debug)]
pub struct RemoteClient {
    connection: Connection,
}

impl RemoteClient {
    pub(crate) fn new(
        config: PacketManagerConfig,
        context: TransportContext,
        endpoint: SocketAddr,
        client_salt: u64,
    ) -> Self {
        let connection = Connection::new(config, context, endpoint);
        connection.statistics().adopt_remote_salt(client_salt);
        Self { connection }
    }

    /// The client's address.
    pub fn endpoint(&self) -> SocketAddr {
        self.connection.endpoint()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Connection statistics.
    pub fn statistics(&self) -> &NetworkStatistics {
        self.connection.statistics()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Answer a CONNECT with a CHALLENGE carrying the local salt.
    ///
    /// Repeated CONNECTs while connecting re-send the challenge.
    pub(crate) fn on_connect(&self) -> bool {
        if self.state() != ConnectionState::Connecting {
            return false;
        }
        let salt = self.statistics().salt();
        self.connection
            .send_control(SegmentType::CHALLENGE, |encoder| {
                encoder.write_u64(salt);
            })
    }

    /// Check the client's answer to our challenge.
    pub(crate) fn on_answer(&self, segment: &Segment) -> AnswerOutcome {
        if self.state().is_closing() {
            return AnswerOutcome::Ignored;
        }
        let Ok(answer) = BinaryDecoder::new(segment).read_u64() else {
            warn!(client = %self.endpoint(), "suspicious client: malformed challenge answer");
            return AnswerOutcome::Rejected;
        };

        let statistics = self.statistics();
        let expected = challenge_answer(statistics.salt(), statistics.remote_salt());
        if answer != expected {
            warn!(client = %self.endpoint(), "suspicious client: wrong challenge answer");
            return AnswerOutcome::Rejected;
        }

        let first = self.connection.mark_connected();
        if !first {
            debug!(client = %self.endpoint(), "repeated challenge answer, resending ACCEPTED");
        }
        self.connection.send_control(SegmentType::ACCEPTED, |_| {});
        AnswerOutcome::Accepted { first }
    }
}
