//! The reliability engine.
//!
//! A [`PacketManager`] sits between one connection and its socket. The
//! simulation thread enqueues segments and ticks it; the transmitter task
//! flushes it and the receiver task queries it.
//!
//! Three narrow locks guard the shared state and are always taken in this
//! order: send queues, waiting-ack map, bundle map.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::error::TransportResult;
use super::policy::{DeliveryPolicy, UnreliableLink};
use super::socket::DatagramSocket;
use super::statistics::NetworkStatistics;
use super::transceiver::PacketTransceiver;
use crate::core::constants::{
    BUNDLE_PURGE_INTERVAL, DEFAULT_MAX_RETRIES, DEFAULT_POOL_SIZE, DEFAULT_RESEND_RTT_MULTIPLIER,
};
use crate::core::{PacketListener, TransportContext};
use crate::segment::{PooledSegment, Segment, SegmentPool, SegmentType};

/// Packet manager configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketManagerConfig {
    /// Segments pre-allocated for the connection.
    pub pool_size: u16,
    /// Retransmissions before a reliable segment is dropped.
    pub max_retries: u8,
    /// Resend interval as a multiple of the smoothed ping.
    pub resend_rtt_multiplier: f32,
}

impl Default for PacketManagerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            resend_rtt_multiplier: DEFAULT_RESEND_RTT_MULTIPLIER,
        }
    }
}

impl PacketManagerConfig {
    /// Set the pool size.
    pub fn with_pool_size(mut self, size: u16) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the retransmission limit.
    pub fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the resend multiplier.
    pub fn with_resend_rtt_multiplier(mut self, multiplier: f32) -> Self {
        self.resend_rtt_multiplier = multiplier;
        self
    }
}

/// What one call to [`PacketManager::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Reliable segments queued again.
    pub resent: usize,
    /// Reliable segments dropped after exhausting their retries.
    pub max_tries_reached: usize,
    /// Bundles expired without an ack.
    pub bundles_lost: usize,
}

/// What one call to [`PacketManager::query_begin`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOutcome {
    /// Segments handed to the caller.
    pub surfaced: usize,
    /// Reliable segments dropped as duplicates.
    pub duplicates: usize,
    /// Reliable segments the peer acknowledged.
    pub delivered: usize,
    /// An ack-only segment was queued; the transmitter should be woken.
    pub ack_queued: bool,
}

/// A reliable segment waiting for its ack.
struct SegmentInfo {
    segment: PooledSegment,
    listener: Option<Arc<dyn PacketListener>>,
    /// `None` until the segment has actually been sent.
    last_sent: Option<Duration>,
    retries: u8,
}

/// A sent datagram that carried reliable segments.
struct Bundle {
    reliable_uids: SmallVec<[u32; 16]>,
    timestamp: Duration,
}

enum Outgoing {
    Unreliable(PooledSegment),
    /// The segment itself stays in the waiting-ack map.
    Reliable(u32),
}

struct SendQueues {
    queues: [VecDeque<Outgoing>; 2],
    active: usize,
}

impl SendQueues {
    fn active(&mut self) -> &mut VecDeque<Outgoing> {
        &mut self.queues[self.active]
    }
}

struct ReceiveState<P> {
    policy: P,
    segments: Vec<PooledSegment>,
    acks: Vec<u32>,
}

/// Reliable/unreliable delivery over one remote endpoint.
///
/// Generic over the [`DeliveryPolicy`] that orders received segments;
/// [`UnreliableLink`] is the policy for UDP.
pub struct PacketManager<P: DeliveryPolicy = UnreliableLink> {
    config: PacketManagerConfig,
    context: TransportContext,
    endpoint: SocketAddr,
    pool: SegmentPool,
    statistics: NetworkStatistics,
    queues: Mutex<SendQueues>,
    waiting: Mutex<HashMap<u32, SegmentInfo>>,
    bundles: Mutex<HashMap<u32, Bundle>>,
    receive: Mutex<ReceiveState<P>>,
    purge_timer: Mutex<Duration>,
}

impl<P: DeliveryPolicy + Default> PacketManager<P> {
    /// Create a manager with the policy's default state.
    pub fn new(config: PacketManagerConfig, context: TransportContext, endpoint: SocketAddr) -> Self {
        Self::with_policy(config, context, endpoint, P::default())
    }
}

impl<P: DeliveryPolicy> PacketManager<P> {
    /// Create a manager with an explicit policy.
    pub fn with_policy(
        config: PacketManagerConfig,
        context: TransportContext,
        endpoint: SocketAddr,
        policy: P,
    ) -> Self {
        Self {
            config,
            context,
            endpoint,
            pool: SegmentPool::new(config.pool_size),
            statistics: NetworkStatistics::new(),
            queues: Mutex::new(SendQueues {
                queues: [VecDeque::new(), VecDeque::new()],
                active: 0,
            }),
            waiting: Mutex::new(HashMap::new()),
            bundles: Mutex::new(HashMap::new()),
            receive: Mutex::new(ReceiveState {
                policy,
                segments: Vec::new(),
                acks: Vec::new(),
            }),
            purge_timer: Mutex::new(Duration::ZERO),
        }
    }

    /// Borrow a segment from this manager's pool and set its type.
    pub fn request_segment(&self, segment_type: SegmentType) -> Option<PooledSegment> {
        let mut segment = self.pool.request_free_segment()?;
        segment.set_type(segment_type);
        Some(segment)
    }

    /// Queue a segment for ordered, acknowledged delivery.
    ///
    /// Returns the segment's UID.
    pub fn enqueue_segment_reliable(
        &self,
        mut segment: PooledSegment,
        listener: Option<Arc<dyn PacketListener>>,
    ) -> u32 {
        let mut queues = self.queues.lock();
        let mut waiting = self.waiting.lock();
        let uid = self.statistics.next_uid();
        let reliable_uid = self.statistics.next_reliable_uid();
        segment.assign_ids(uid, reliable_uid);
        waiting.insert(
            reliable_uid,
            SegmentInfo {
                segment,
                listener,
                last_sent: None,
                retries: 0,
            },
        );
        queues.active().push_back(Outgoing::Reliable(reliable_uid));
        uid
    }

    /// Queue a segment for best-effort delivery.
    ///
    /// Returns the segment's UID.
    pub fn enqueue_segment_unreliable(&self, mut segment: PooledSegment) -> u32 {
        let mut queues = self.queues.lock();
        let uid = self.statistics.next_uid();
        segment.assign_ids(uid, 0);
        queues.active().push_back(Outgoing::Unreliable(segment));
        uid
    }

    /// Send everything queued so far.
    ///
    /// Swaps the active queue, then bundles and sends from the other one
    /// until it is empty. Returns the number of datagrams sent.
    pub async fn flush<S: DatagramSocket>(
        &self,
        transceiver: &mut PacketTransceiver<S>,
    ) -> TransportResult<usize> {
        let index = {
            let mut queues = self.queues.lock();
            let index = queues.active;
            queues.active ^= 1;
            index
        };

        let mut sent = 0;
        loop {
            let mut reliable_uids: SmallVec<[u32; 16]> = SmallVec::new();
            let encoded = {
                let mut queues = self.queues.lock();
                if queues.queues[index].is_empty() {
                    break;
                }
                let waiting = self.waiting.lock();
                let queue = &mut queues.queues[index];
                transceiver.encode(&self.statistics, |writer| {
                    while let Some(front) = queue.front() {
                        let written = match front {
                            Outgoing::Unreliable(segment) => writer.push(segment),
                            Outgoing::Reliable(reliable_uid) => match waiting.get(reliable_uid) {
                                Some(info) => {
                                    let written = writer.push(&info.segment);
                                    if written {
                                        reliable_uids.push(*reliable_uid);
                                    }
                                    written
                                }
                                // Acknowledged or given up on since it was queued.
                                None => true,
                            },
                        };
                        if !written {
                            break;
                        }
                        queue.pop_front();
                    }
                })
            };

            let Some(bundle) = encoded else {
                continue;
            };
            let now = self.context.now();
            transceiver
                .send_encoded(bundle, self.endpoint, &self.statistics, now)
                .await?;
            sent += 1;

            if !reliable_uids.is_empty() {
                {
                    let mut waiting = self.waiting.lock();
                    for reliable_uid in &reliable_uids {
                        if let Some(info) = waiting.get_mut(reliable_uid) {
                            info.last_sent = Some(now);
                        }
                    }
                }
                self.bundles.lock().insert(
                    bundle.sequence,
                    Bundle {
                        reliable_uids,
                        timestamp: now,
                    },
                );
            }
        }
        Ok(sent)
    }

    /// Unpack the datagram the transceiver just received.
    ///
    /// Acknowledged segments are released and reported to their listeners.
    /// Segments for the application are appended to `out` in delivery
    /// order; hand them back with [`query_end`](Self::query_end).
    pub fn query_begin<S: DatagramSocket>(
        &self,
        transceiver: &mut PacketTransceiver<S>,
        out: &mut Vec<PooledSegment>,
    ) -> TransportResult<QueryOutcome> {
        let now = self.context.now();
        let mut receive = self.receive.lock();
        let ReceiveState {
            policy,
            segments,
            acks,
        } = &mut *receive;
        segments.clear();
        acks.clear();

        transceiver.receive_end(&self.pool, segments, acks, &self.statistics, now)?;
        let acked: SmallVec<[u32; 33]> = acks.iter().copied().collect();

        let before = out.len();
        let sorted = policy.sort_received(segments, &self.statistics, out);
        drop(receive);

        let delivered = self.handle_acks(&acked, now);

        let ack_queued = sorted.has_reliable && self.enqueue_ack_if_idle();
        Ok(QueryOutcome {
            surfaced: out.len() - before,
            duplicates: sorted.duplicates,
            delivered,
            ack_queued,
        })
    }

    /// Return segments surfaced by [`query_begin`](Self::query_begin) to the pool.
    pub fn query_end(&self, segments: &mut Vec<PooledSegment>) {
        if self.pool.free_segments(segments).is_err() {
            warn!(endpoint = %self.endpoint, "query_end received segments from another pool");
        }
    }

    /// Advance timers by `delta`.
    ///
    /// Once per second expired bundles are counted as lost. Every call
    /// queues overdue reliable segments again and drops those that have
    /// used up their retries.
    pub fn tick(&self, delta: Duration) -> TickReport {
        let mut report = TickReport::default();

        let purge = {
            let mut timer = self.purge_timer.lock();
            *timer += delta;
            if *timer >= BUNDLE_PURGE_INTERVAL {
                *timer = timer.saturating_sub(BUNDLE_PURGE_INTERVAL);
                if *timer >= BUNDLE_PURGE_INTERVAL {
                    *timer = Duration::ZERO;
                }
                true
            } else {
                false
            }
        };
        if purge {
            report.bundles_lost = self.purge_expired_bundles();
        }

        if P::RESENDS {
            self.resend_or_drop(&mut report);
        }
        report
    }

    /// Drop every queued, waiting and buffered segment and zero the statistics.
    pub fn reset(&self) {
        {
            let mut queues = self.queues.lock();
            for queue in &mut queues.queues {
                queue.clear();
            }
            queues.active = 0;
        }
        self.waiting.lock().clear();
        self.bundles.lock().clear();
        {
            let mut receive = self.receive.lock();
            receive.policy.reset();
            receive.segments.clear();
            receive.acks.clear();
        }
        *self.purge_timer.lock() = Duration::ZERO;
        self.statistics.reset();
        self.pool.reset();
    }

    fn handle_acks(&self, acks: &[u32], now: Duration) -> usize {
        if acks.is_empty() {
            return 0;
        }

        let mut acked: SmallVec<[u32; 32]> = SmallVec::new();
        let mut rtt_total = Duration::ZERO;
        let mut rtt_samples = 0u32;
        {
            let mut bundles = self.bundles.lock();
            for sequence in acks {
                if let Some(bundle) = bundles.remove(sequence) {
                    rtt_total += now.saturating_sub(bundle.timestamp);
                    rtt_samples += 1;
                    acked.extend(bundle.reliable_uids);
                }
            }
        }
        if rtt_samples > 0 {
            self.statistics.register_rtt(rtt_total / rtt_samples);
        }
        if acked.is_empty() {
            return 0;
        }

        let mut delivered: SmallVec<[SegmentInfo; 8]> = SmallVec::new();
        {
            let mut waiting = self.waiting.lock();
            for reliable_uid in acked {
                if let Some(info) = waiting.remove(&reliable_uid) {
                    delivered.push(info);
                }
            }
        }

        let count = delivered.len();
        for info in delivered {
            if let Some(listener) = &info.listener {
                listener.on_packet_delivered(&info.segment);
            }
        }
        count
    }

    fn enqueue_ack_if_idle(&self) -> bool {
        let Some(mut ack) = self.request_segment(SegmentType::NETWORK_ACK) else {
            return false;
        };
        let mut queues = self.queues.lock();
        if !queues.active().is_empty() {
            return false;
        }
        ack.assign_ids(self.statistics.next_uid(), 0);
        queues.active().push_back(Outgoing::Unreliable(ack));
        true
    }

    fn purge_expired_bundles(&self) -> usize {
        let lifetime = self.statistics.bundle_lifetime();
        let now = self.context.now();
        let lost = {
            let mut bundles = self.bundles.lock();
            let before = bundles.len();
            bundles.retain(|_, bundle| now.saturating_sub(bundle.timestamp) <= lifetime);
            before - bundles.len()
        };
        if lost > 0 {
            self.statistics.register_packets_lost(lost);
            debug!(endpoint = %self.endpoint, lost, "expired unacknowledged bundles");
        }
        lost
    }

    fn resend_or_drop(&self, report: &mut TickReport) {
        let interval = self
            .statistics
            .resend_interval(self.config.resend_rtt_multiplier);
        let now = self.context.now();
        let mut exhausted: SmallVec<[u32; 8]> = SmallVec::new();
        let mut dropped: SmallVec<[SegmentInfo; 4]> = SmallVec::new();
        let mut resent: Vec<(Segment, u8, Arc<dyn PacketListener>)> = Vec::new();

        {
            let mut queues = self.queues.lock();
            let mut waiting = self.waiting.lock();
            for (reliable_uid, info) in waiting.iter_mut() {
                let Some(last_sent) = info.last_sent else {
                    continue;
                };
                if now.saturating_sub(last_sent) <= interval {
                    continue;
                }
                if info.retries >= self.config.max_retries {
                    exhausted.push(*reliable_uid);
                    continue;
                }

                info.retries += 1;
                info.last_sent = None;
                queues.active().push_back(Outgoing::Reliable(*reliable_uid));
                self.statistics.register_segment_resent();
                report.resent += 1;
                trace!(reliable_uid, retries = info.retries, "resending segment");
                if let Some(listener) = &info.listener {
                    resent.push((info.segment.snapshot(), info.retries, listener.clone()));
                }
            }
            for reliable_uid in exhausted {
                if let Some(info) = waiting.remove(&reliable_uid) {
                    dropped.push(info);
                }
            }
        }

        for (segment, retries, listener) in resent {
            listener.on_packet_resent(&segment, retries);
        }

        for info in dropped {
            warn!(
                endpoint = %self.endpoint,
                reliable_uid = info.segment.reliable_uid(),
                retries = info.retries,
                "reliable segment dropped after max retries"
            );
            report.max_tries_reached += 1;
            if let Some(listener) = &info.listener {
                listener.on_packet_max_tries_reached(&info.segment, info.retries);
            }
        }
    }

    /// The remote endpoint.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// The segment pool.
    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    /// Connection statistics.
    pub fn statistics(&self) -> &NetworkStatistics {
        &self.statistics
    }

    /// The configuration.
    pub fn config(&self) -> &PacketManagerConfig {
        &self.config
    }

    /// The runtime context.
    pub fn context(&self) -> &TransportContext {
        &self.context
    }

    /// Reliable segments still waiting for an ack.
    pub fn waiting_for_ack(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Sent bundles whose ack has not arrived.
    pub fn bundles_in_flight(&self) -> usize {
        self.bundles.lock().len()
    }

    /// Whether anything is queued for the next flush.
    pub fn has_pending_output(&self) -> bool {
        !self.queues.lock().active().is_empty()
    }
}

impl<P: DeliveryPolicy> fmt::Debug for PacketManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketManager")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}
