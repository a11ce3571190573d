//! Bundle wire format.
//!
//! A bundle is one datagram: a fixed header followed by `segment_count`
//! segments, each a [`SegmentHeader`] plus payload.
//!
//! ```text
//! +--------+-------+----------+---------+---------+-----------+----------------+
//! | size   | count | sequence | salt    | ack     | ack bits  | segments ...   |
//! | u16 LE | u8    | u32 LE   | u64 LE  | u32 LE  | u32 LE    |                |
//! +--------+-------+----------+---------+---------+-----------+----------------+
//! ```
//!
//! `ack` is the newest bundle sequence received from the peer and bit `i`
//! of `ack bits` acknowledges `ack - 1 - i`.

use thiserror::Error;

use crate::core::constants::{
    ACK_BITS, BUNDLE_HEADER_SIZE, MAX_DATAGRAM_SIZE, MAX_SEGMENTS_PER_BUNDLE, MAX_SEGMENT_SIZE,
    SEGMENT_HEADER_SIZE,
};
use crate::segment::{Segment, SegmentHeader};

/// Errors that can occur during bundle parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BundleError {
    /// Datagram is too short.
    #[error("bundle too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Declared size differs from the datagram length.
    #[error("bundle size mismatch: header says {declared}, datagram has {actual} bytes")]
    SizeMismatch {
        /// Size from the header.
        declared: usize,
        /// Bytes actually received.
        actual: usize,
    },

    /// Datagram exceeds the protocol limit.
    #[error("bundle of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),

    /// Bundle declares no segments.
    #[error("bundle carries no segments")]
    EmptyBundle,

    /// A segment runs past the end of the datagram.
    #[error("segment {index} overruns the bundle")]
    SegmentOverrun {
        /// Position of the segment within the bundle.
        index: usize,
    },

    /// A segment declares an impossible size.
    #[error("segment {index} declares invalid size {size}")]
    InvalidSegmentSize {
        /// Position of the segment within the bundle.
        index: usize,
        /// Declared size.
        size: usize,
    },
}

/// Bundle header (23 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BundleHeader {
    /// Whole datagram length, header included.
    pub size: u16,
    /// Number of segments that follow.
    pub segment_count: u8,
    /// Sender's bundle sequence, starting at 1.
    pub sequence: u32,
    /// Sender's salt.
    pub salt: u64,
    /// Newest sequence received from the peer, zero if none.
    pub ack: u32,
    /// Earlier sequences received from the peer.
    pub ack_bits: u32,
}

impl BundleHeader {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; BUNDLE_HEADER_SIZE] {
        let mut buf = [0u8; BUNDLE_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.size.to_le_bytes());
        buf[2] = self.segment_count;
        buf[3..7].copy_from_slice(&self.sequence.to_le_bytes());
        buf[7..15].copy_from_slice(&self.salt.to_le_bytes());
        buf[15..19].copy_from_slice(&self.ack.to_le_bytes());
        buf[19..23].copy_from_slice(&self.ack_bits.to_le_bytes());
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BundleError> {
        if bytes.len() < BUNDLE_HEADER_SIZE {
            return Err(BundleError::TooShort {
                expected: BUNDLE_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut salt = [0u8; 8];
        salt.copy_from_slice(&bytes[7..15]);

        Ok(Self {
            size: u16::from_le_bytes([bytes[0], bytes[1]]),
            segment_count: bytes[2],
            sequence: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
            salt: u64::from_le_bytes(salt),
            ack: u32::from_le_bytes([bytes[15], bytes[16], bytes[17], bytes[18]]),
            ack_bits: u32::from_le_bytes([bytes[19], bytes[20], bytes[21], bytes[22]]),
        })
    }

    /// Parse and validate the header of a whole datagram.
    pub fn parse(datagram: &[u8]) -> Result<Self, BundleError> {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(BundleError::TooLarge(datagram.len()));
        }
        let header = Self::from_bytes(datagram)?;
        if header.size as usize != datagram.len() {
            return Err(BundleError::SizeMismatch {
                declared: header.size as usize,
                actual: datagram.len(),
            });
        }
        if header.segment_count == 0 {
            return Err(BundleError::EmptyBundle);
        }
        Ok(header)
    }

    /// Bundle sequences this header acknowledges.
    pub fn acked_sequences(&self) -> AckedSequences {
        AckedSequences {
            ack: self.ack,
            bits: self.ack_bits,
            next: 0,
        }
    }
}

/// Iterator over the sequences acknowledged by one header.
#[derive(Debug, Clone)]
pub struct AckedSequences {
    ack: u32,
    bits: u32,
    next: u32,
}

impl Iterator for AckedSequences {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.ack == 0 {
            return None;
        }
        if self.next == 0 {
            self.next = 1;
            return Some(self.ack);
        }
        while self.next <= ACK_BITS {
            let offset = self.next;
            self.next += 1;
            if offset >= self.ack {
                return None;
            }
            if self.bits & (1 << (offset - 1)) != 0 {
                return Some(self.ack - offset);
            }
        }
        None
    }
}

/// Record of bundle sequences received from a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceWindow {
    latest: u32,
    bits: u32,
}

impl SequenceWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `sequence` as received.
    ///
    /// Returns `false` if it was already received or is too old to track.
    pub fn record(&mut self, sequence: u32) -> bool {
        if sequence == 0 {
            return false;
        }
        if self.latest == 0 {
            self.latest = sequence;
            return true;
        }
        if sequence > self.latest {
            let shift = sequence - self.latest;
            self.bits = self.bits.checked_shl(shift).unwrap_or(0);
            if shift <= ACK_BITS {
                self.bits |= 1 << (shift - 1);
            }
            self.latest = sequence;
            return true;
        }
        if sequence == self.latest {
            return false;
        }
        let offset = self.latest - sequence;
        if offset > ACK_BITS {
            return false;
        }
        let mask = 1 << (offset - 1);
        if self.bits & mask != 0 {
            return false;
        }
        self.bits |= mask;
        true
    }

    /// The `(ack, ack_bits)` pair to send back.
    pub fn ack(&self) -> (u32, u32) {
        (self.latest, self.bits)
    }
}

/// Writes segments into a datagram buffer, leaving room for the header.
pub struct BundleWriter<'a> {
    buffer: &'a mut [u8; MAX_DATAGRAM_SIZE],
    len: usize,
    count: usize,
}

impl<'a> BundleWriter<'a> {
    /// Start an empty bundle in `buffer`.
    pub fn new(buffer: &'a mut [u8; MAX_DATAGRAM_SIZE]) -> Self {
        Self {
            buffer,
            len: BUNDLE_HEADER_SIZE,
            count: 0,
        }
    }

    /// Whether `segment` would still fit.
    pub fn fits(&self, segment: &Segment) -> bool {
        self.count < MAX_SEGMENTS_PER_BUNDLE && self.len + segment.wire_size() <= MAX_DATAGRAM_SIZE
    }

    /// Append `segment` if it fits. Returns whether it was written.
    pub fn push(&mut self, segment: &Segment) -> bool {
        if !self.fits(segment) {
            return false;
        }
        let header = segment.header();
        self.buffer[self.len..self.len + SEGMENT_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        self.len += SEGMENT_HEADER_SIZE;
        self.buffer[self.len..self.len + segment.len()].copy_from_slice(segment.buffer());
        self.len += segment.len();
        self.count += 1;
        true
    }

    /// Segments written so far.
    pub fn segment_count(&self) -> usize {
        self.count
    }

    /// Whether no segment has been written.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Write the header and return the datagram length.
    pub fn finish(self, sequence: u32, salt: u64, ack: (u32, u32)) -> usize {
        let header = BundleHeader {
            size: self.len as u16,
            segment_count: self.count as u8,
            sequence,
            salt,
            ack: ack.0,
            ack_bits: ack.1,
        };
        self.buffer[..BUNDLE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        self.len
    }
}

/// Iterator over the segments of a validated datagram.
pub struct BundleSegments<'a> {
    datagram: &'a [u8],
    offset: usize,
    index: usize,
    count: usize,
}

impl<'a> BundleSegments<'a> {
    /// Iterate the segments of `datagram` described by `header`.
    pub fn new(datagram: &'a [u8], header: &BundleHeader) -> Self {
        Self {
            datagram,
            offset: BUNDLE_HEADER_SIZE,
            index: 0,
            count: header.segment_count as usize,
        }
    }
}

impl<'a> Iterator for BundleSegments<'a> {
    type Item = Result<(SegmentHeader, &'a [u8]), BundleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        let index = self.index;
        self.index = self.count;

        let rest = &self.datagram[self.offset..];
        let Some(header) = SegmentHeader::from_bytes(rest) else {
            return Some(Err(BundleError::SegmentOverrun { index }));
        };
        let size = header.size as usize;
        if size < SEGMENT_HEADER_SIZE || size - SEGMENT_HEADER_SIZE > MAX_SEGMENT_SIZE {
            return Some(Err(BundleError::InvalidSegmentSize { index, size }));
        }
        if size > rest.len() {
            return Some(Err(BundleError::SegmentOverrun { index }));
        }

        self.offset += size;
        self.index = index + 1;
        Some(Ok((header, &rest[SEGMENT_HEADER_SIZE..size])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{SegmentPool, SegmentType};

    #[test]
    fn test_bundle_header_roundtrip() {
        let header = BundleHeader {
            size: 512,
            segment_count: 3,
            sequence: 0x0102_0304,
            salt: 0xDEAD_BEEF_CAFE_F00D,
            ack: 77,
            ack_bits: 0b1011,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), BUNDLE_HEADER_SIZE);
        assert_eq!(BundleHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_parse_rejects_bad_sizes() {
        let header = BundleHeader {
            size: 40,
            segment_count: 1,
            ..Default::default()
        };
        let mut datagram = header.to_bytes().to_vec();
        datagram.resize(39, 0);
        assert_eq!(
            BundleHeader::parse(&datagram),
            Err(BundleError::SizeMismatch {
                declared: 40,
                actual: 39
            })
        );

        assert!(matches!(
            BundleHeader::parse(&[0u8; 5]),
            Err(BundleError::TooShort { .. })
        ));

        let empty = BundleHeader {
            size: BUNDLE_HEADER_SIZE as u16,
            ..Default::default()
        };
        assert_eq!(
            BundleHeader::parse(&empty.to_bytes()),
            Err(BundleError::EmptyBundle)
        );
    }

    #[test]
    fn test_acked_sequences() {
        let header = BundleHeader {
            ack: 10,
            ack_bits: 0b101,
            ..Default::default()
        };
        let acked: Vec<u32> = header.acked_sequences().collect();
        assert_eq!(acked, vec![10, 9, 7]);

        let none = BundleHeader::default();
        assert_eq!(none.acked_sequences().count(), 0);

        // Bits pointing below sequence 1 are ignored.
        let early = BundleHeader {
            ack: 2,
            ack_bits: u32::MAX,
            ..Default::default()
        };
        let acked: Vec<u32> = early.acked_sequences().collect();
        assert_eq!(acked, vec![2, 1]);
    }

    #[test]
    fn test_sequence_window() {
        let mut window = SequenceWindow::new();
        assert!(window.record(1));
        assert!(window.record(3));
        assert_eq!(window.ack(), (3, 0b10));

        assert!(window.record(2));
        assert_eq!(window.ack(), (3, 0b11));
        assert!(!window.record(2));
        assert!(!window.record(3));

        assert!(window.record(40));
        assert_eq!(window.ack(), (40, 0));
        assert!(!window.record(3));
        assert!(!window.record(0));
    }

    #[test]
    fn test_sequence_window_shift_by_word() {
        let mut window = SequenceWindow::new();
        window.record(1);
        window.record(33);
        assert_eq!(window.ack(), (33, 1 << 31));
        assert!(window.record(2));
    }

    #[test]
    fn test_writer_and_segments() {
        let pool = SegmentPool::new(2);
        let mut a = pool.request_free_segment().unwrap();
        a.set_type(SegmentType(1)).write(b"hello");
        a.assign_ids(1, 0);
        let mut b = pool.request_free_segment().unwrap();
        b.set_type(SegmentType::PING);
        b.assign_ids(2, 1);

        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        let mut writer = BundleWriter::new(&mut buffer);
        assert!(writer.push(&a));
        assert!(writer.push(&b));
        let len = writer.finish(5, 99, (0, 0));
        assert_eq!(len, BUNDLE_HEADER_SIZE + 2 * SEGMENT_HEADER_SIZE + 5);

        let datagram = &buffer[..len];
        let header = BundleHeader::parse(datagram).unwrap();
        assert_eq!(header.segment_count, 2);
        assert_eq!(header.sequence, 5);
        assert_eq!(header.salt, 99);

        let parsed: Vec<_> = BundleSegments::new(datagram, &header)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(parsed[0].0.segment_type, SegmentType(1));
        assert_eq!(parsed[0].1, b"hello");
        assert_eq!(parsed[1].0.reliable_uid, 1);
        assert!(parsed[1].1.is_empty());
    }

    #[test]
    fn test_writer_refuses_overflow() {
        let pool = SegmentPool::new(2);
        let mut big = pool.request_free_segment().unwrap();
        big.append_bytes(MAX_SEGMENT_SIZE);
        let mut small = pool.request_free_segment().unwrap();
        small.write(&[1]);

        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        let mut writer = BundleWriter::new(&mut buffer);
        assert!(writer.push(&big));
        assert!(!writer.push(&small));
        assert_eq!(writer.segment_count(), 1);
        assert_eq!(writer.finish(1, 1, (0, 0)), MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_truncated_segment_is_rejected() {
        let header = BundleHeader {
            size: (BUNDLE_HEADER_SIZE + SEGMENT_HEADER_SIZE) as u16,
            segment_count: 1,
            ..Default::default()
        };
        let segment = SegmentHeader {
            size: (SEGMENT_HEADER_SIZE + 10) as u16,
            ..Default::default()
        };
        let mut datagram = header.to_bytes().to_vec();
        datagram.extend_from_slice(&segment.to_bytes());

        let parsed = BundleHeader::parse(&datagram).unwrap();
        let result: Result<Vec<_>, _> = BundleSegments::new(&datagram, &parsed).collect();
        assert_eq!(result, Err(BundleError::SegmentOverrun { index: 0 }));
    }
}
