//! Wire sizes, reserved segment types and timing defaults.
//!
//! The wire values are shared by every peer and MUST NOT be changed
//! independently on one side.

use std::time::Duration;

// =============================================================================
// DATAGRAM LAYOUT
// =============================================================================

/// Largest datagram ever handed to the socket.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Bundle header size (size + count + sequence + salt + ack + ack bits).
pub const BUNDLE_HEADER_SIZE: usize = 23;

/// Segment header size (size + type + uid + reliable uid).
pub const SEGMENT_HEADER_SIZE: usize = 12;

/// Payload capacity of a single segment.
///
/// Chosen so that one full segment always fits in one datagram.
pub const MAX_SEGMENT_SIZE: usize = MAX_DATAGRAM_SIZE - BUNDLE_HEADER_SIZE - SEGMENT_HEADER_SIZE;

/// Segment count is carried in one byte.
pub const MAX_SEGMENTS_PER_BUNDLE: usize = u8::MAX as usize;

/// Receive buffer size, large enough for any UDP payload.
pub const RECEIVE_BUFFER_SIZE: usize = u16::MAX as usize;

/// Number of earlier bundle sequences acknowledged through the ack bitfield.
pub const ACK_BITS: u32 = 32;

// =============================================================================
// RESERVED SEGMENT TYPES
// =============================================================================

/// Unset segment type.
pub const TYPE_UNDEFINED: u16 = u16::MAX;

/// Keepalive / latency probe.
pub const TYPE_PING: u16 = u16::MAX - 1;

/// Server refused the connection because it is full.
pub const TYPE_SERVER_FULL: u16 = u16::MAX - 2;

/// Server refused the connection because it is not accepting clients.
pub const TYPE_SERVER_NOT_ACCEPTING: u16 = u16::MAX - 3;

/// Handshake opener sent by the initiator.
pub const TYPE_CONNECT: u16 = u16::MAX - 4;

/// Graceful termination.
pub const TYPE_DISCONNECT: u16 = u16::MAX - 5;

/// Handshake challenge and its answer.
pub const TYPE_CHALLENGE: u16 = u16::MAX - 6;

/// Handshake completion.
pub const TYPE_ACCEPTED: u16 = u16::MAX - 7;

/// Acknowledgment-only filler segment.
pub const TYPE_NETWORK_ACK: u16 = u16::MAX - 8;

/// LAN discovery request and reply.
pub const TYPE_NETWORK_DISCOVERY: u16 = u16::MAX - 9;

/// Broadcast payload.
pub const TYPE_BROADCAST: u16 = u16::MAX - 10;

/// Lowest reserved type value; application types must stay below it.
pub const FIRST_RESERVED_TYPE: u16 = TYPE_BROADCAST;

// =============================================================================
// RELIABILITY
// =============================================================================

/// Default number of segments pre-allocated per connection.
pub const DEFAULT_POOL_SIZE: u16 = 512;

/// Default retransmissions before a reliable segment is given up on.
pub const DEFAULT_MAX_RETRIES: u8 = 10;

/// Default resend interval as a multiple of the smoothed ping.
pub const DEFAULT_RESEND_RTT_MULTIPLIER: f32 = 2.0;

/// Floor for the resend interval.
pub const MIN_RESEND_INTERVAL: Duration = Duration::from_millis(5);

/// Unacknowledged bundles expire after this many pings.
pub const BUNDLE_LIFETIME_PING_MULTIPLIER: f64 = 100.0;

/// Floor for the bundle lifetime.
pub const MIN_BUNDLE_LIFETIME: Duration = Duration::from_secs(1);

/// Period of the expired-bundle purge.
pub const BUNDLE_PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Weight of a new sample in the ping average.
pub const PING_SMOOTHING: f64 = 0.2;

// =============================================================================
// CONNECTION
// =============================================================================

/// Heartbeat period of the transmitter task.
pub const DEFAULT_TRANSMIT_INTERVAL: Duration = Duration::from_millis(50);

/// Handshake step resend period.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Maximum handshake resends before the initiator gives up.
pub const HANDSHAKE_MAX_RETRIES: u32 = 5;

/// Default client slots on a server.
pub const DEFAULT_MAX_CLIENTS: u8 = 10;

/// Default port game servers listen on.
pub const DEFAULT_SERVER_PORT: u16 = 4451;

/// Segments a server keeps for datagrams from endpoints it does not know.
pub const ADMISSION_POOL_SIZE: u16 = 16;

// =============================================================================
// DISCOVERY
// =============================================================================

/// Port discovery hosts listen on.
pub const DEFAULT_DISCOVERY_PORT: u16 = 4450;

/// Search broadcast period.
pub const DEFAULT_SEARCH_INTERVAL: Duration = Duration::from_secs(1);

/// A server not heard from for this long is dropped from the list.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool size of discovery endpoints, which hold one segment at a time.
pub const DISCOVERY_POOL_SIZE: u16 = 8;
