//! The atomic message unit.

use std::fmt;

use crate::core::constants::{self, MAX_SEGMENT_SIZE, SEGMENT_HEADER_SIZE};

/// Segment type tag.
///
/// Reserved values occupy the top of the u16 range; application types use
/// everything below [`constants::FIRST_RESERVED_TYPE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentType(pub u16);

impl SegmentType {
    /// Unset type.
    pub const UNDEFINED: Self = Self(constants::TYPE_UNDEFINED);
    /// Keepalive and latency measurement.
    pub const PING: Self = Self(constants::TYPE_PING);
    /// Server is full.
    pub const SERVER_FULL: Self = Self(constants::TYPE_SERVER_FULL);
    /// Server is not accepting clients.
    pub const SERVER_NOT_ACCEPTING: Self = Self(constants::TYPE_SERVER_NOT_ACCEPTING);
    /// Handshake opener.
    pub const CONNECT: Self = Self(constants::TYPE_CONNECT);
    /// Graceful termination.
    pub const DISCONNECT: Self = Self(constants::TYPE_DISCONNECT);
    /// Handshake challenge / answer.
    pub const CHALLENGE: Self = Self(constants::TYPE_CHALLENGE);
    /// Handshake completion.
    pub const ACCEPTED: Self = Self(constants::TYPE_ACCEPTED);
    /// Acknowledgment-only filler.
    pub const NETWORK_ACK: Self = Self(constants::TYPE_NETWORK_ACK);
    /// LAN discovery.
    pub const NETWORK_DISCOVERY: Self = Self(constants::TYPE_NETWORK_DISCOVERY);
    /// Broadcast payload.
    pub const BROADCAST: Self = Self(constants::TYPE_BROADCAST);

    /// Create an application segment type.
    ///
    /// Returns `None` if `value` collides with a reserved type.
    pub const fn application(value: u16) -> Option<Self> {
        if value < constants::FIRST_RESERVED_TYPE {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Get the raw value.
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Whether this is one of the transport's own types.
    pub const fn is_reserved(self) -> bool {
        self.0 >= constants::FIRST_RESERVED_TYPE
    }

    fn reserved_name(self) -> Option<&'static str> {
        let name = match self {
            Self::UNDEFINED => "UNDEFINED",
            Self::PING => "PING",
            Self::SERVER_FULL => "SERVER_FULL",
            Self::SERVER_NOT_ACCEPTING => "SERVER_NOT_ACCEPTING",
            Self::CONNECT => "CONNECT",
            Self::DISCONNECT => "DISCONNECT",
            Self::CHALLENGE => "CHALLENGE",
            Self::ACCEPTED => "ACCEPTED",
            Self::NETWORK_ACK => "NETWORK_ACK",
            Self::NETWORK_DISCOVERY => "NETWORK_DISCOVERY",
            Self::BROADCAST => "BROADCAST",
            _ => return None,
        };
        Some(name)
    }
}

impl Default for SegmentType {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reserved_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "USER({})", self.0),
        }
    }
}

/// Segment header as carried on the wire (12 bytes).
///
/// ```text
/// +--------+--------+------------+-----------------+
/// | size   | type   | uid        | reliable uid    |
/// | u16 LE | u16 LE | u32 LE     | u32 LE          |
/// +--------+--------+------------+-----------------+
/// ```
///
/// `size` counts header and payload together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentHeader {
    /// Header plus payload length.
    pub size: u16,
    /// Type tag.
    pub segment_type: SegmentType,
    /// Per-connection identifier of every segment.
    pub uid: u32,
    /// Per-connection identifier of reliable segments, zero otherwise.
    pub reliable_uid: u32,
}

impl SegmentHeader {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.size.to_le_bytes());
        buf[2..4].copy_from_slice(&self.segment_type.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.uid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.reliable_uid.to_le_bytes());
        buf
    }

    /// Parse from bytes. Returns `None` if fewer than 12 bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SEGMENT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            size: u16::from_le_bytes([bytes[0], bytes[1]]),
            segment_type: SegmentType(u16::from_le_bytes([bytes[2], bytes[3]])),
            uid: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            reliable_uid: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

/// A message: header plus a fixed-capacity payload buffer.
///
/// Segments only exist inside a [`SegmentPool`](super::SegmentPool) and are
/// handed out as [`PooledSegment`](super::PooledSegment) handles.
pub struct Segment {
    header: SegmentHeader,
    remote_salt: u64,
    len: usize,
    slot: u16,
    buffer: [u8; MAX_SEGMENT_SIZE],
}

impl Segment {
    pub(crate) fn new(slot: u16) -> Self {
        Self {
            header: SegmentHeader::default(),
            remote_salt: 0,
            len: 0,
            slot,
            buffer: [0u8; MAX_SEGMENT_SIZE],
        }
    }

    /// Set the segment type.
    pub fn set_type(&mut self, segment_type: SegmentType) -> &mut Self {
        self.header.segment_type = segment_type;
        self
    }

    /// Get the segment type.
    pub fn segment_type(&self) -> SegmentType {
        self.header.segment_type
    }

    /// The written part of the payload.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// The whole payload buffer, for writing in place before [`append_bytes`](Self::append_bytes).
    pub fn buffer_mut(&mut self) -> &mut [u8; MAX_SEGMENT_SIZE] {
        &mut self.buffer
    }

    /// Grow the written length by `count` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the payload would exceed [`MAX_SEGMENT_SIZE`].
    pub fn append_bytes(&mut self, count: usize) -> &mut Self {
        assert!(
            self.len + count <= MAX_SEGMENT_SIZE,
            "segment overflow: {} + {} > {}",
            self.len,
            count,
            MAX_SEGMENT_SIZE
        );
        self.len += count;
        self
    }

    /// Copy `bytes` to the end of the payload.
    ///
    /// # Panics
    ///
    /// Panics if the payload would exceed [`MAX_SEGMENT_SIZE`].
    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        let start = self.len;
        self.append_bytes(bytes.len());
        self.buffer[start..self.len].copy_from_slice(bytes);
        self
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes still writable.
    pub fn remaining(&self) -> usize {
        MAX_SEGMENT_SIZE - self.len
    }

    /// Size on the wire, header included.
    pub fn wire_size(&self) -> usize {
        SEGMENT_HEADER_SIZE + self.len
    }

    /// The header as it will be written, with `size` filled in.
    pub fn header(&self) -> SegmentHeader {
        SegmentHeader {
            size: self.wire_size() as u16,
            ..self.header
        }
    }

    /// Per-connection UID.
    pub fn uid(&self) -> u32 {
        self.header.uid
    }

    /// Reliable UID, zero for unreliable segments.
    pub fn reliable_uid(&self) -> u32 {
        self.header.reliable_uid
    }

    /// Whether the segment travels on the reliable channel.
    pub fn is_reliable(&self) -> bool {
        self.header.reliable_uid != 0
    }

    /// Salt of the bundle this segment arrived in, zero for outgoing segments.
    pub fn remote_salt(&self) -> u64 {
        self.remote_salt
    }

    /// Copy type and payload from `other`. Identifiers are not copied.
    pub fn copy_from(&mut self, other: &Segment) {
        self.header.segment_type = other.header.segment_type;
        self.buffer[..other.len].copy_from_slice(other.buffer());
        self.len = other.len;
    }

    /// Detached copy for listener callbacks. It never returns to a pool.
    pub(crate) fn snapshot(&self) -> Segment {
        Segment {
            header: self.header,
            remote_salt: self.remote_salt,
            len: self.len,
            slot: self.slot,
            buffer: self.buffer,
        }
    }

    pub(crate) fn slot(&self) -> u16 {
        self.slot
    }

    pub(crate) fn assign_ids(&mut self, uid: u32, reliable_uid: u32) {
        self.header.uid = uid;
        self.header.reliable_uid = reliable_uid;
    }

    /// Fill from a received header and payload.
    pub(crate) fn load(&mut self, header: SegmentHeader, payload: &[u8], remote_salt: u64) {
        self.header = header;
        self.buffer[..payload.len()].copy_from_slice(payload);
        self.len = payload.len();
        self.remote_salt = remote_salt;
    }

    pub(crate) fn clear(&mut self) {
        self.header = SegmentHeader::default();
        self.remote_salt = 0;
        self.len = 0;
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("type", &self.header.segment_type)
            .field("uid", &self.header.uid)
            .field("reliable_uid", &self.header.reliable_uid)
            .field("len", &self.len)
            .finish()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Type={}], [Size={}], [UID={}], [ReliableUID={}]",
            self.header.segment_type, self.len, self.header.uid, self.header.reliable_uid
        )
    }
}
