//! Core traits for Tether.
//!
//! These traits are the contract between the reliability engine and the
//! layers above it.

use crate::segment::Segment;

/// Delivery notifications for a reliable segment.
///
/// Attach a listener when enqueueing a reliable segment to learn what
/// happened to it. Every method has a no-op default, so implementors only
/// override the events they care about.
///
/// # Requirements
///
/// - Callbacks run on the task that ticks or receives for the connection,
///   after the manager has released its locks
/// - A callback may use the same connection, including enqueueing; the
///   segment it is handed is only borrowed for the call
///
/// # Example
///
/// ```ignore
/// struct ChatAcks;
///
/// impl PacketListener for ChatAcks {
///     fn on_packet_delivered(&self, segment: &Segment) {
///         tracing::info!(uid = segment.uid(), "chat line delivered");
///     }
/// }
///
/// client.send_reliable(segment, Some(Arc::new(ChatAcks)))?;
/// ```
pub trait PacketListener: Send + Sync {
    /// The segment was acknowledged by the remote peer.
    fn on_packet_delivered(&self, segment: &Segment) {
        let _ = segment;
    }

    /// The segment was queued again after its ack did not arrive in time.
    fn on_packet_resent(&self, segment: &Segment, retries: u8) {
        let _ = (segment, retries);
    }

    /// The segment exhausted its retransmissions and was dropped.
    fn on_packet_max_tries_reached(&self, segment: &Segment, retries: u8) {
        let _ = (segment, retries);
    }
}
