//! How received segments are classified and released to the application.

use std::collections::BTreeMap;

use tracing::trace;

use super::statistics::{NetworkStatistics, next_reliable_after};
use crate::segment::{PooledSegment, SegmentType};

/// Summary of one sorted batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortOutcome {
    /// At least one reliable segment arrived, so an ack is owed.
    pub has_reliable: bool,
    /// Segments that were dropped as duplicates.
    pub duplicates: usize,
}

/// Ordering strategy of a [`PacketManager`](super::PacketManager).
pub trait DeliveryPolicy: Send + 'static {
    /// Whether unacknowledged reliable segments are retransmitted on tick.
    const RESENDS: bool;

    /// Classify `received` and move everything the application should see
    /// into `out`, in delivery order. `received` is left empty.
    fn sort_received(
        &mut self,
        received: &mut Vec<PooledSegment>,
        statistics: &NetworkStatistics,
        out: &mut Vec<PooledSegment>,
    ) -> SortOutcome;

    /// Drop all buffered state.
    fn reset(&mut self);

    /// Segments held back waiting for a gap to fill.
    fn buffered(&self) -> usize {
        0
    }
}

/// Policy for a link that loses, duplicates and reorders datagrams.
///
/// Reliable segments are released strictly in reliable-UID order. Early
/// arrivals wait in the untangle set until the gap before them fills.
#[derive(Debug, Default)]
pub struct UnreliableLink {
    untangle: BTreeMap<u32, PooledSegment>,
}

impl UnreliableLink {
    /// Create an empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    fn release_consecutive(&mut self, statistics: &NetworkStatistics, out: &mut Vec<PooledSegment>) {
        let mut expected = next_reliable_after(statistics.last_received_reliable_uid());
        while let Some(entry) = self.untangle.first_entry() {
            if *entry.key() != expected {
                break;
            }
            out.push(entry.remove());
            statistics.register_reliable_segment_received();
            expected = next_reliable_after(expected);
        }
    }
}

impl DeliveryPolicy for UnreliableLink {
    const RESENDS: bool = true;

    fn sort_received(
        &mut self,
        received: &mut Vec<PooledSegment>,
        statistics: &NetworkStatistics,
        out: &mut Vec<PooledSegment>,
    ) -> SortOutcome {
        let mut outcome = SortOutcome::default();
        let start = statistics.last_received_reliable_uid();

        for segment in received.drain(..) {
            if !segment.is_reliable() {
                if segment.segment_type() != SegmentType::NETWORK_ACK {
                    out.push(segment);
                }
                continue;
            }

            outcome.has_reliable = true;
            let reliable_uid = segment.reliable_uid();
            let last = statistics.last_received_reliable_uid();
            let expected = next_reliable_after(last);
            if reliable_uid == expected {
                out.push(segment);
                statistics.register_reliable_segment_received();
            } else if reliable_uid > last {
                if self.untangle.contains_key(&reliable_uid) {
                    outcome.duplicates += 1;
                } else {
                    trace!(reliable_uid, expected, "buffering early segment");
                    self.untangle.insert(reliable_uid, segment);
                }
            } else {
                outcome.duplicates += 1;
            }
        }

        if statistics.last_received_reliable_uid() != start {
            self.release_consecutive(statistics, out);
        }
        outcome
    }

    fn reset(&mut self) {
        self.untangle.clear();
    }

    fn buffered(&self) -> usize {
        self.untangle.len()
    }
}

/// Policy for a link that already delivers in order without loss.
///
/// Every segment is released as it arrives and nothing is resent.
#[derive(Debug, Default)]
pub struct ReliableLink;

impl ReliableLink {
    /// Create the policy.
    pub fn new() -> Self {
        Self
    }
}

impl DeliveryPolicy for ReliableLink {
    const RESENDS: bool = false;

    fn sort_received(
        &mut self,
        received: &mut Vec<PooledSegment>,
        statistics: &NetworkStatistics,
        out: &mut Vec<PooledSegment>,
    ) -> SortOutcome {
        let mut outcome = SortOutcome::default();
        for segment in received.drain(..) {
            if segment.is_reliable() {
                outcome.has_reliable = true;
                let expected = next_reliable_after(statistics.last_received_reliable_uid());
                if segment.reliable_uid() != expected {
                    outcome.duplicates += 1;
                    continue;
                }
                statistics.register_reliable_segment_received();
            }
            if segment.segment_type() != SegmentType::NETWORK_ACK {
                out.push(segment);
            }
        }
        outcome
    }

    fn reset(&mut self) {}
}
