//! Segments, the pool they live in, and the payload codec.

mod codec;
mod pool;
#[allow(clippy::module_inception)]
mod segment;

pub use codec::{BinaryDecoder, BinaryEncoder};
pub use pool::{PooledSegment, SegmentPool};
pub use segment::{Segment, SegmentHeader, SegmentType};
