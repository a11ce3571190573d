//! LAN server discovery.
//!
//! A [`DiscoverySearcher`] broadcasts a NETWORK_DISCOVERY segment naming
//! the game once per search interval. Every [`DiscoveryHost`] running the
//! same game unicasts back a reply describing its game server. Neither
//! side performs a handshake, so salts are not checked.
//!
//! # Wire format
//!
//! ```text
//! request:  string game_name
//! reply:    string game_name | u16 game_port | string server_name
//!           | u64 server_uid | hook fields...
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::core::CodecError;
use crate::segment::{BinaryDecoder, BinaryEncoder, Segment, SegmentType};

mod host;
mod searcher;

pub use host::{DiscoveryHost, DiscoveryHostConfig};
pub use searcher::{DiscoverySearcher, DiscoverySearcherConfig};

/// Errors that can occur in discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No tokio runtime to run the socket tasks on.
    #[error("discovery must be started inside a tokio runtime")]
    NoRuntime,
}

/// A game server announced by a discovery host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    /// Address of the game server: the host's IP with the announced port.
    pub address: SocketAddr,

    /// Human-readable server name.
    pub server_name: String,

    /// Random identifier the host picked at startup.
    pub server_uid: u64,

    /// Port of the game server.
    pub game_port: u16,

    /// Fields written by the host's reply hook, in wire order.
    pub extra: Vec<u8>,

    /// When the last reply arrived, on the searcher's clock.
    pub last_seen: Duration,
}

impl DiscoveredServer {
    /// Decoder over the hook fields.
    pub fn extra_decoder(&self) -> BinaryDecoder<'_> {
        BinaryDecoder::from_bytes(&self.extra)
    }
}

/// Change to a searcher's server list.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A server answered for the first time.
    ServerFound(DiscoveredServer),

    /// A known server answered again.
    ServerUpdated(DiscoveredServer),

    /// A server stopped answering.
    ServerLost(DiscoveredServer),
}

fn write_request(segment: &mut Segment, game_name: &str) {
    segment.set_type(SegmentType::NETWORK_DISCOVERY);
    BinaryEncoder::new(segment).write_string(game_name);
}

/// Read a request. `None` unless the segment carries exactly one name.
fn read_request(segment: &Segment) -> Option<&str> {
    if segment.segment_type() != SegmentType::NETWORK_DISCOVERY {
        return None;
    }
    let mut decoder = BinaryDecoder::new(segment);
    let name = decoder.read_str().ok()?;
    (decoder.remaining() == 0).then_some(name)
}

/// Reply fields before the hook section.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply<'a> {
    game_name: &'a str,
    game_port: u16,
    server_name: &'a str,
    server_uid: u64,
    extra: &'a [u8],
}

fn read_reply(segment: &Segment) -> Result<Reply<'_>, CodecError> {
    let mut decoder = BinaryDecoder::new(segment);
    let game_name = decoder.read_str()?;
    let game_port = decoder.read_u16()?;
    let server_name = decoder.read_str()?;
    let server_uid = decoder.read_u64()?;
    let extra = decoder.read_bytes(decoder.remaining())?;
    Ok(Reply {
        game_name,
        game_port,
        server_name,
        server_uid,
        extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentPool;

    #[test]
    fn test_request_must_be_a_bare_name() {
        let pool = SegmentPool::new(2);
        let mut segment = pool.request_free_segment().unwrap();
        write_request(&mut segment, "arena");
        assert_eq!(read_request(&segment), Some("arena"));

        BinaryEncoder::new(&mut segment).write_u16(4451);
        assert_eq!(read_request(&segment), None);

        let mut other = pool.request_free_segment().unwrap();
        other.set_type(SegmentType(5));
        BinaryEncoder::new(&mut other).write_string("arena");
        assert_eq!(read_request(&other), None);
    }

    #[test]
    fn test_reply_keeps_hook_fields() {
        let pool = SegmentPool::new(1);
        let mut segment = pool.request_free_segment().unwrap();
        BinaryEncoder::new(&mut segment)
            .write_string("arena")
            .write_u16(4451)
            .write_string("den")
            .write_u64(77)
            .write_u8(3)
            .write_string("docks");

        let reply = read_reply(&segment).unwrap();
        assert_eq!(reply.game_name, "arena");
        assert_eq!(reply.game_port, 4451);
        assert_eq!(reply.server_name, "den");
        assert_eq!(reply.server_uid, 77);

        let mut extra = BinaryDecoder::from_bytes(reply.extra);
        assert_eq!(extra.read_u8().unwrap(), 3);
        assert_eq!(extra.read_str().unwrap(), "docks");
    }

    #[test]
    fn test_truncated_reply_is_rejected() {
        let pool = SegmentPool::new(1);
        let mut segment = pool.request_free_segment().unwrap();
        BinaryEncoder::new(&mut segment).write_string("arena").write_u16(4451);
        assert!(matches!(
            read_reply(&segment),
            Err(CodecError::EndOfSegment { .. })
        ));
    }
}
