//! # Tether
//!
//! Reliable, connection-oriented messaging over UDP for real-time
//! multiplayer games. Tether provides:
//!
//! - **Segments**: pooled, fixed-capacity message buffers with a typed
//!   little-endian codec
//! - **Bundling**: many segments per datagram, with piggybacked acks
//! - **Reliability**: ordered, acknowledged delivery with RTT-adaptive
//!   resends next to a best-effort path
//! - **Connections**: a salted challenge handshake with server admission
//!   control
//! - **Discovery**: broadcast LAN rendezvous for server browsers
//!
//! ## Feature Flags
//!
//! - `transport` (default): sockets, transceiver, packet manager, connections
//! - `client` (default): [`client::Client`]
//! - `server` (default): [`server::Server`]
//! - `discovery` (default): LAN discovery host and searcher
//!
//! ## Modules
//!
//! - [`core`]: Constants, errors, clock and context (always included)
//! - [`segment`]: Segments, the segment pool and the codec (always included)
//! - [`transport`]: Bundles, statistics, transceiver and packet manager
//! - [`connection`]: Handshake state and connection events
//! - [`client`], [`server`]: High-level endpoints
//! - [`discovery`]: LAN rendezvous
//!
//! ## Example Usage
//!
//! ```rust
//! use tether_net::prelude::*;
//!
//! let pool = SegmentPool::new(4);
//! let mut segment = pool.request_free_segment().unwrap();
//! segment.set_type(SegmentType(12));
//! BinaryEncoder::new(&mut segment)
//!     .write_string("player-1")
//!     .write_vec3(Vec3::new(1.0, 0.0, -2.5));
//!
//! let mut decoder = BinaryDecoder::new(&segment);
//! assert_eq!(decoder.read_string().unwrap(), "player-1");
//! assert_eq!(decoder.read_vec3().unwrap(), Vec3::new(1.0, 0.0, -2.5));
//!
//! drop(segment);
//! assert_eq!(pool.free_count(), 4);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Segments and codec (always included)
pub mod segment;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Connection plumbing shared by client and server
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod connection;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

// LAN discovery (feature-gated)
#[cfg(feature = "discovery")]
#[cfg_attr(docsrs, doc(cfg(feature = "discovery")))]
pub mod discovery;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core and segment types
    pub use crate::core::*;
    pub use crate::segment::*;

    // Math types carried by the codec
    pub use glam::{Quat, Vec2, Vec3, Vec4};

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        DatagramSocket, DeliveryPolicy, MemoryNetwork, NetworkStatistics, PacketManager,
        PacketManagerConfig, PacketTransceiver, ReliableLink, TransportError, TransportResult,
        UdpDatagramSocket, UnreliableLink,
    };

    #[cfg(feature = "transport")]
    pub use crate::connection::{Connection, ConnectionEvent, ConnectionState, DisconnectReason};

    #[cfg(feature = "client")]
    pub use crate::client::{Client, ClientBuilder, ClientConfig, ClientError};

    #[cfg(feature = "server")]
    pub use crate::server::{RemoteClient, Server, ServerBuilder, ServerConfig, ServerError, ServerEvent};

    #[cfg(feature = "discovery")]
    pub use crate::discovery::{
        DiscoveredServer, DiscoveryEvent, DiscoveryHost, DiscoveryHostConfig, DiscoverySearcher,
        DiscoverySearcherConfig,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{PacketListener, TetherError, TransportContext};
pub use crate::segment::{BinaryDecoder, BinaryEncoder, PooledSegment, Segment, SegmentPool, SegmentType};

#[cfg(feature = "transport")]
pub use crate::transport::{NetworkStatistics, PacketManager, PacketTransceiver};
