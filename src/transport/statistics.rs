//! Per-connection counters, ping and salts.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use super::bundle::SequenceWindow;
use super::timing::PingEstimator;

fn generate_salt() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

/// The reliable UID after `uid`. Zero marks unreliable segments, so the
/// sequence wraps from `u32::MAX` back to one.
pub(crate) fn next_reliable_after(uid: u32) -> u32 {
    uid.checked_add(1).unwrap_or(1)
}

fn advance_reliable(counter: &AtomicU32) -> u32 {
    let previous = counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |uid| {
            Some(next_reliable_after(uid))
        })
        .unwrap_or_else(|uid| uid);
    next_reliable_after(previous)
}

/// Counters and estimates for one connection.
///
/// Shared between the simulation thread and the network tasks; every
/// field is an atomic or sits behind its own small lock.
#[derive(Debug)]
pub struct NetworkStatistics {
    packets_sent: AtomicU32,
    packets_received: AtomicU32,
    packets_lost: AtomicU32,
    packet_sequence: AtomicU32,
    segments_registered: AtomicU32,
    reliable_segments_registered: AtomicU32,
    segments_sent: AtomicU32,
    segments_received: AtomicU32,
    segments_resent: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_received_reliable_uid: AtomicU32,
    last_sent_micros: AtomicU64,
    last_received_micros: AtomicU64,
    salt: AtomicU64,
    remote_salt: AtomicU64,
    ping: Mutex<PingEstimator>,
    received_sequences: Mutex<SequenceWindow>,
}

impl Default for NetworkStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStatistics {
    /// Create zeroed statistics with a fresh random salt.
    pub fn new() -> Self {
        Self {
            packets_sent: AtomicU32::new(0),
            packets_received: AtomicU32::new(0),
            packets_lost: AtomicU32::new(0),
            packet_sequence: AtomicU32::new(0),
            segments_registered: AtomicU32::new(0),
            reliable_segments_registered: AtomicU32::new(0),
            segments_sent: AtomicU32::new(0),
            segments_received: AtomicU32::new(0),
            segments_resent: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_received_reliable_uid: AtomicU32::new(0),
            last_sent_micros: AtomicU64::new(0),
            last_received_micros: AtomicU64::new(0),
            salt: AtomicU64::new(generate_salt()),
            remote_salt: AtomicU64::new(0),
            ping: Mutex::new(PingEstimator::new()),
            received_sequences: Mutex::new(SequenceWindow::new()),
        }
    }

    /// Zero every counter and pick a new salt.
    pub fn reset(&self) {
        for counter in [
            &self.packets_sent,
            &self.packets_received,
            &self.packets_lost,
            &self.packet_sequence,
            &self.segments_registered,
            &self.reliable_segments_registered,
            &self.segments_sent,
            &self.segments_received,
            &self.segments_resent,
            &self.last_received_reliable_uid,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in [
            &self.bytes_sent,
            &self.bytes_received,
            &self.last_sent_micros,
            &self.last_received_micros,
            &self.remote_salt,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.salt.store(generate_salt(), Ordering::Relaxed);
        *self.ping.lock() = PingEstimator::new();
        *self.received_sequences.lock() = SequenceWindow::new();
    }

    // ---- identifiers -------------------------------------------------------

    pub(crate) fn next_uid(&self) -> u32 {
        self.segments_registered
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    pub(crate) fn next_reliable_uid(&self) -> u32 {
        advance_reliable(&self.reliable_segments_registered)
    }

    pub(crate) fn next_packet_sequence(&self) -> u32 {
        self.packet_sequence
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    // ---- registration ------------------------------------------------------

    pub(crate) fn register_packet_sent(&self, segments: usize, bytes: usize, now: Duration) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.segments_sent
            .fetch_add(segments as u32, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_sent_micros
            .store(now.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn register_packet_received(&self, segments: usize, bytes: usize, now: Duration) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.segments_received
            .fetch_add(segments as u32, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_received_micros
            .store(now.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn register_segment_resent(&self) {
        self.segments_resent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn register_packets_lost(&self, count: usize) {
        self.packets_lost
            .fetch_add(count as u32, Ordering::Relaxed);
    }

    pub(crate) fn register_rtt(&self, sample: Duration) {
        self.ping.lock().update(sample);
    }

    /// Advance the in-order reliable counter, returning the new value.
    pub(crate) fn register_reliable_segment_received(&self) -> u32 {
        advance_reliable(&self.last_received_reliable_uid)
    }

    #[cfg(test)]
    pub(crate) fn set_last_received_reliable_uid(&self, uid: u32) {
        self.last_received_reliable_uid.store(uid, Ordering::Relaxed);
    }

    /// Record a received bundle sequence. Returns `false` for duplicates.
    pub(crate) fn record_received_sequence(&self, sequence: u32) -> bool {
        self.received_sequences.lock().record(sequence)
    }

    /// Adopt `salt` as the peer's salt if none is set yet.
    ///
    /// Returns the salt in effect afterwards.
    pub(crate) fn adopt_remote_salt(&self, salt: u64) -> u64 {
        match self
            .remote_salt
            .compare_exchange(0, salt, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => salt,
            Err(existing) => existing,
        }
    }

    // ---- queries -----------------------------------------------------------

    /// The `(ack, ack_bits)` pair for the next outgoing bundle.
    pub fn ack_window(&self) -> (u32, u32) {
        self.received_sequences.lock().ack()
    }

    /// Local salt sent in every bundle header.
    pub fn salt(&self) -> u64 {
        self.salt.load(Ordering::Relaxed)
    }

    /// Salt adopted from the peer, zero until its first bundle arrives.
    pub fn remote_salt(&self) -> u64 {
        self.remote_salt.load(Ordering::Relaxed)
    }

    /// Smoothed round-trip time.
    pub fn ping(&self) -> Duration {
        self.ping.lock().ping()
    }

    /// Smoothed round-trip time in milliseconds.
    pub fn ping_ms(&self) -> f64 {
        self.ping.lock().ping_ms()
    }

    /// Resend age for the given multiplier.
    pub fn resend_interval(&self, multiplier: f32) -> Duration {
        self.ping.lock().resend_interval(multiplier)
    }

    /// Age after which an unacknowledged bundle is lost.
    pub fn bundle_lifetime(&self) -> Duration {
        self.ping.lock().bundle_lifetime()
    }

    /// Highest reliable UID surfaced in order.
    pub fn last_received_reliable_uid(&self) -> u32 {
        self.last_received_reliable_uid.load(Ordering::Relaxed)
    }

    /// Datagrams sent.
    pub fn packets_sent(&self) -> u32 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Datagrams received and accepted.
    pub fn packets_received(&self) -> u32 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Bundles that expired without an ack.
    pub fn packets_lost(&self) -> u32 {
        self.packets_lost.load(Ordering::Relaxed)
    }

    /// Segments that have been assigned a UID.
    pub fn segments_registered(&self) -> u32 {
        self.segments_registered.load(Ordering::Relaxed)
    }

    /// Reliable segments that have been assigned a reliable UID.
    pub fn reliable_segments_registered(&self) -> u32 {
        self.reliable_segments_registered.load(Ordering::Relaxed)
    }

    /// Segments written to the socket, resends included.
    pub fn segments_sent(&self) -> u32 {
        self.segments_sent.load(Ordering::Relaxed)
    }

    /// Segments received.
    pub fn segments_received(&self) -> u32 {
        self.segments_received.load(Ordering::Relaxed)
    }

    /// Reliable segments queued again after a missed ack.
    pub fn segments_resent(&self) -> u32 {
        self.segments_resent.load(Ordering::Relaxed)
    }

    /// Bytes written to the socket.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes received.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Time of the last send on the context clock.
    pub fn last_sent_at(&self) -> Duration {
        Duration::from_micros(self.last_sent_micros.load(Ordering::Relaxed))
    }

    /// Time of the last accepted receive on the context clock.
    pub fn last_received_at(&self) -> Duration {
        Duration::from_micros(self.last_received_micros.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salt_is_never_zero() {
        for _ in 0..64 {
            assert_ne!(NetworkStatistics::new().salt(), 0);
        }
    }

    #[test]
    fn test_identifiers_start_at_one() {
        let stats = NetworkStatistics::new();
        assert_eq!(stats.next_uid(), 1);
        assert_eq!(stats.next_uid(), 2);
        assert_eq!(stats.next_reliable_uid(), 1);
        assert_eq!(stats.next_packet_sequence(), 1);
        assert_eq!(stats.segments_registered(), 2);
        assert_eq!(stats.reliable_segments_registered(), 1);
    }

    #[test]
    fn test_reliable_uid_skips_zero_on_wrap() {
        let stats = NetworkStatistics::new();
        stats
            .reliable_segments_registered
            .store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(stats.next_reliable_uid(), u32::MAX);
        assert_eq!(stats.next_reliable_uid(), 1);
        assert_eq!(stats.next_reliable_uid(), 2);

        stats.segments_registered.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(stats.next_uid(), 0);
    }

    #[test]
    fn test_remote_salt_is_adopted_once() {
        let stats = NetworkStatistics::new();
        assert_eq!(stats.adopt_remote_salt(42), 42);
        assert_eq!(stats.adopt_remote_salt(7), 42);
        assert_eq!(stats.remote_salt(), 42);
    }

    #[test]
    fn test_counters_and_reset() {
        let stats = NetworkStatistics::new();
        let salt = stats.salt();
        stats.register_packet_sent(3, 100, Duration::from_millis(5));
        stats.register_packet_received(1, 40, Duration::from_millis(9));
        stats.register_packets_lost(2);
        stats.register_segment_resent();
        stats.register_rtt(Duration::from_millis(50));
        assert_eq!(stats.register_reliable_segment_received(), 1);
        assert!(stats.record_received_sequence(4));

        assert_eq!(stats.packets_sent(), 1);
        assert_eq!(stats.segments_sent(), 3);
        assert_eq!(stats.bytes_sent(), 100);
        assert_eq!(stats.bytes_received(), 40);
        assert_eq!(stats.packets_lost(), 2);
        assert_eq!(stats.segments_resent(), 1);
        assert_eq!(stats.last_received_at(), Duration::from_millis(9));
        assert_eq!(stats.ack_window(), (4, 0));
        assert!(stats.ping_ms() > 49.0);

        stats.reset();
        assert_eq!(stats.packets_sent(), 0);
        assert_eq!(stats.last_received_reliable_uid(), 0);
        assert_eq!(stats.ack_window(), (0, 0));
        assert_eq!(stats.ping(), Duration::ZERO);
        assert_ne!(stats.salt(), 0);
        // Two random salts colliding is not a realistic outcome.
        assert_ne!(stats.salt(), salt);
    }
}
