//! Transport layer.
//!
//! Everything between a queued segment and a UDP datagram:
//!
//! - **Bundles**: [`BundleHeader`], [`BundleWriter`] and the wire layout
//! - **Statistics**: [`NetworkStatistics`] with ping estimation ([`PingEstimator`])
//! - **Transceiver**: [`PacketTransceiver`] packs segments into datagrams and back
//! - **Reliability**: [`PacketManager`] with a pluggable [`DeliveryPolicy`]
//! - **Sockets**: the [`DatagramSocket`] seam, tokio UDP and an in-memory network
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Client / Server / Discovery        │
//! ├─────────────────────────────────────────┤
//! │           PacketManager                 │  ← queues, acks, resends
//! ├─────────────────────────────────────────┤
//! │         PacketTransceiver               │  ← bundles, salts, loss
//! ├─────────────────────────────────────────┤
//! │    DatagramSocket (UDP or memory)       │
//! └─────────────────────────────────────────┘
//! ```

mod bundle;
mod error;
mod manager;
mod memory;
mod policy;
mod socket;
mod statistics;
mod timing;
mod transceiver;

pub use bundle::*;
pub use error::*;
pub use manager::{PacketManager, PacketManagerConfig, QueryOutcome, TickReport};
pub use memory::{LinkConditions, MemoryNetwork, MemorySocket};
pub use policy::{DeliveryPolicy, ReliableLink, SortOutcome, UnreliableLink};
pub use socket::{DatagramSocket, UdpDatagramSocket, UdpDatagramSocketBuilder};
pub use statistics::NetworkStatistics;
pub use timing::PingEstimator;
pub use transceiver::{EncodedBundle, PacketTransceiver};
