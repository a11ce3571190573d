//! Pre-allocated segment arena.
//!
//! All segments of a pool are allocated once in [`SegmentPool::new`] and
//! recycled for the pool's lifetime. A borrowed segment is represented by a
//! [`PooledSegment`] handle that owns it exclusively and returns it to the
//! free list when dropped, so a segment can never be freed twice.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use super::segment::Segment;
use crate::core::PoolError;

struct PoolState {
    free: Vec<Box<Segment>>,
    borrowed: Vec<bool>,
}

struct PoolShared {
    capacity: u16,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn release(&self, mut segment: Box<Segment>) {
        segment.clear();
        let mut state = self.state.lock();
        let slot = segment.slot() as usize;
        debug_assert!(state.borrowed[slot], "segment {slot} returned twice");
        state.borrowed[slot] = false;
        state.free.push(segment);
    }
}

/// A fixed-size pool of segments with LIFO reuse.
///
/// Cloning is cheap and yields another handle to the same pool.
#[derive(Clone)]
pub struct SegmentPool {
    shared: Arc<PoolShared>,
}

impl SegmentPool {
    /// Allocate a pool of `capacity` segments.
    pub fn new(capacity: u16) -> Self {
        let free = (0..capacity)
            .rev()
            .map(|slot| Box::new(Segment::new(slot)))
            .collect();
        Self {
            shared: Arc::new(PoolShared {
                capacity,
                state: Mutex::new(PoolState {
                    free,
                    borrowed: vec![false; capacity as usize],
                }),
            }),
        }
    }

    /// Borrow the most recently freed segment.
    ///
    /// Returns `None` and logs when the pool is exhausted; callers should
    /// treat that as backpressure.
    pub fn request_free_segment(&self) -> Option<PooledSegment> {
        let mut state = self.shared.state.lock();
        match state.free.pop() {
            Some(segment) => {
                state.borrowed[segment.slot() as usize] = true;
                Some(PooledSegment::new(segment, self.shared.clone()))
            }
            None => {
                error!(capacity = self.shared.capacity, "segment pool exhausted");
                None
            }
        }
    }

    /// Borrow `count` segments at once, or none at all.
    pub fn request_free_segments(
        &self,
        count: usize,
        out: &mut Vec<PooledSegment>,
    ) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        let available = state.free.len();
        if available < count {
            error!(requested = count, available, "segment pool exhausted");
            return Err(PoolError::Exhausted {
                requested: count,
                available,
            });
        }
        out.reserve(count);
        for _ in 0..count {
            if let Some(segment) = state.free.pop() {
                state.borrowed[segment.slot() as usize] = true;
                out.push(PooledSegment::new(segment, self.shared.clone()));
            }
        }
        Ok(())
    }

    /// Return a segment to this pool.
    ///
    /// Segments from another pool are rejected; they still go back to
    /// their own pool when the handle is dropped.
    pub fn free_segment(&self, segment: PooledSegment) -> Result<(), PoolError> {
        if !Arc::ptr_eq(&self.shared, &segment.pool) {
            warn!("rejected free of a segment from another pool");
            return Err(PoolError::ForeignSegment);
        }
        drop(segment);
        Ok(())
    }

    /// Return every segment in `segments`, leaving it empty.
    pub fn free_segments(&self, segments: &mut Vec<PooledSegment>) -> Result<(), PoolError> {
        let mut result = Ok(());
        for segment in segments.drain(..) {
            if let Err(e) = self.free_segment(segment) {
                result = Err(e);
            }
        }
        result
    }

    /// Restore the free list to its initial order.
    ///
    /// Outstanding handles are unaffected and still return on drop; call
    /// this after the owning connection has dropped everything it held.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        let outstanding = state.borrowed.iter().filter(|b| **b).count();
        if outstanding > 0 {
            warn!(outstanding, "pool reset with borrowed segments");
        }
        state.free.sort_unstable_by_key(|s| std::cmp::Reverse(s.slot()));
    }

    /// Total number of segments.
    pub fn capacity(&self) -> u16 {
        self.shared.capacity
    }

    /// Segments currently free.
    pub fn free_count(&self) -> u16 {
        self.shared.state.lock().free.len() as u16
    }

    /// Segments currently borrowed.
    pub fn borrowed_count(&self) -> u16 {
        self.shared.capacity - self.free_count()
    }
}

impl fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentPool")
            .field("capacity", &self.shared.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}

/// Exclusive handle to a borrowed segment.
///
/// Dereferences to [`Segment`]. Dropping the handle returns the segment
/// to its pool.
pub struct PooledSegment {
    segment: Option<Box<Segment>>,
    pool: Arc<PoolShared>,
}

impl PooledSegment {
    fn new(segment: Box<Segment>, pool: Arc<PoolShared>) -> Self {
        Self {
            segment: Some(segment),
            pool,
        }
    }
}

impl Deref for PooledSegment {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        // Only `Drop` takes the segment out.
        match &self.segment {
            Some(segment) => segment,
            None => unreachable!("pooled segment used after release"),
        }
    }
}

impl DerefMut for PooledSegment {
    fn deref_mut(&mut self) -> &mut Segment {
        match &mut self.segment {
            Some(segment) => segment,
            None => unreachable!("pooled segment used after release"),
        }
    }
}

impl Drop for PooledSegment {
    fn drop(&mut self) {
        if let Some(segment) = self.segment.take() {
            self.pool.release(segment);
        }
    }
}

impl fmt::Debug for PooledSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl fmt::Display for PooledSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentType;

    #[test]
    fn test_pool_conservation() {
        let pool = SegmentPool::new(4);
        assert_eq!(pool.free_count(), 4);

        let a = pool.request_free_segment().unwrap();
        let b = pool.request_free_segment().unwrap();
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.borrowed_count(), 2);

        pool.free_segment(a).unwrap();
        drop(b);
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn test_lifo_reuse() {
        let pool = SegmentPool::new(3);
        let first = pool.request_free_segment().unwrap();
        let slot = first.slot();
        let _second = pool.request_free_segment().unwrap();
        drop(first);

        let again = pool.request_free_segment().unwrap();
        assert_eq!(again.slot(), slot);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pool = SegmentPool::new(1);
        let held = pool.request_free_segment();
        assert!(held.is_some());
        assert!(pool.request_free_segment().is_none());
        drop(held);
        assert!(pool.request_free_segment().is_some());
    }

    #[test]
    fn test_batch_request_is_all_or_nothing() {
        let pool = SegmentPool::new(3);
        let mut out = Vec::new();
        let err = pool.request_free_segments(4, &mut out).unwrap_err();
        assert_eq!(
            err,
            PoolError::Exhausted {
                requested: 4,
                available: 3
            }
        );
        assert!(out.is_empty());
        assert_eq!(pool.free_count(), 3);

        pool.request_free_segments(3, &mut out).unwrap();
        assert_eq!(pool.free_count(), 0);
        pool.free_segments(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_foreign_segment_is_rejected() {
        let pool = SegmentPool::new(2);
        let other = SegmentPool::new(2);
        let segment = other.request_free_segment().unwrap();

        assert_eq!(pool.free_segment(segment), Err(PoolError::ForeignSegment));
        assert_eq!(pool.free_count(), 2);
        assert_eq!(other.free_count(), 2);
    }

    #[test]
    fn test_returned_segment_is_cleared() {
        let pool = SegmentPool::new(1);
        let mut segment = pool.request_free_segment().unwrap();
        segment.set_type(SegmentType::PING).write(b"stale");
        drop(segment);

        let segment = pool.request_free_segment().unwrap();
        assert!(segment.is_empty());
        assert_eq!(segment.segment_type(), SegmentType::UNDEFINED);
    }

    #[test]
    fn test_reset_restores_order() {
        let pool = SegmentPool::new(3);
        let a = pool.request_free_segment().unwrap();
        let b = pool.request_free_segment().unwrap();
        drop(a);
        drop(b);
        pool.reset();

        let first = pool.request_free_segment().unwrap();
        assert_eq!(first.slot(), 0);
        assert_eq!(pool.free_count(), 2);
    }
}
