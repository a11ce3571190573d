//! Bundling and unbundling of segments over a datagram socket.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};

use super::bundle::{BundleHeader, BundleSegments, BundleWriter};
use super::error::{TransportError, TransportResult};
use super::socket::DatagramSocket;
use super::statistics::NetworkStatistics;
use crate::core::constants::{MAX_DATAGRAM_SIZE, RECEIVE_BUFFER_SIZE};
use crate::segment::{PooledSegment, SegmentPool};

/// A bundle encoded into the send buffer, waiting to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedBundle {
    /// Bundle sequence written into the header.
    pub sequence: u32,
    /// Datagram length.
    pub len: usize,
    /// Segments in the bundle.
    pub segment_count: usize,
}

fn map_io(error: io::Error) -> TransportError {
    if error.kind() == io::ErrorKind::ConnectionAborted {
        TransportError::Closed
    } else {
        TransportError::Io(error)
    }
}

/// Turns queued segments into datagrams and datagrams back into segments.
///
/// One transceiver serves one direction of one socket: the transmitter
/// task owns one for sending and the receiver task owns another for
/// receiving. Both buffers are allocated once.
pub struct PacketTransceiver<S> {
    socket: Arc<S>,
    send_buffer: Box<[u8; MAX_DATAGRAM_SIZE]>,
    receive_buffer: Box<[u8]>,
    received_len: usize,
    ignore_salt_mismatch: bool,
    transmit_loss: f64,
    receive_loss: f64,
}

impl<S: DatagramSocket> PacketTransceiver<S> {
    /// Create a transceiver over `socket`.
    pub fn new(socket: Arc<S>) -> Self {
        Self {
            socket,
            send_buffer: Box::new([0u8; MAX_DATAGRAM_SIZE]),
            receive_buffer: vec![0u8; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
            received_len: 0,
            ignore_salt_mismatch: false,
            transmit_loss: 0.0,
            receive_loss: 0.0,
        }
    }

    /// The underlying socket.
    pub fn socket(&self) -> &Arc<S> {
        &self.socket
    }

    /// Skip the salt check, for traffic that precedes any handshake.
    pub fn set_ignore_salt_mismatch(&mut self, ignore: bool) {
        self.ignore_salt_mismatch = ignore;
    }

    /// Drop a fraction of outgoing and incoming datagrams on purpose.
    pub fn set_simulated_loss(&mut self, transmit: f64, receive: f64) {
        self.transmit_loss = transmit.clamp(0.0, 1.0);
        self.receive_loss = receive.clamp(0.0, 1.0);
    }

    /// Encode a bundle whose segments are chosen by `fill`.
    ///
    /// Returns `None` if `fill` wrote nothing.
    pub fn encode<F>(&mut self, statistics: &NetworkStatistics, fill: F) -> Option<EncodedBundle>
    where
        F: FnOnce(&mut BundleWriter<'_>),
    {
        let mut writer = BundleWriter::new(&mut self.send_buffer);
        fill(&mut writer);
        if writer.is_empty() {
            return None;
        }
        let segment_count = writer.segment_count();
        let sequence = statistics.next_packet_sequence();
        let len = writer.finish(sequence, statistics.salt(), statistics.ack_window());
        Some(EncodedBundle {
            sequence,
            len,
            segment_count,
        })
    }

    /// Send the bundle last produced by [`encode`](Self::encode) in one call.
    pub async fn send_encoded(
        &mut self,
        bundle: EncodedBundle,
        target: SocketAddr,
        statistics: &NetworkStatistics,
        now: Duration,
    ) -> TransportResult<()> {
        statistics.register_packet_sent(bundle.segment_count, bundle.len, now);
        if self.transmit_loss > 0.0 && rand::thread_rng().gen_bool(self.transmit_loss) {
            trace!(sequence = bundle.sequence, "simulated transmit loss");
            return Ok(());
        }
        self.socket
            .send_to(&self.send_buffer[..bundle.len], target)
            .await
            .map_err(map_io)?;
        trace!(
            sequence = bundle.sequence,
            segments = bundle.segment_count,
            bytes = bundle.len,
            %target,
            "bundle sent"
        );
        Ok(())
    }

    /// Send segments from the front of `queue` as one datagram.
    ///
    /// Segments that do not fit stay queued. Returns the number sent.
    pub async fn transmit(
        &mut self,
        queue: &mut VecDeque<PooledSegment>,
        target: SocketAddr,
        statistics: &NetworkStatistics,
        now: Duration,
    ) -> TransportResult<usize> {
        let encoded = self.encode(statistics, |writer| {
            while let Some(front) = queue.front() {
                if !writer.push(front) {
                    break;
                }
                queue.pop_front();
            }
        });
        match encoded {
            Some(bundle) => {
                self.send_encoded(bundle, target, statistics, now).await?;
                Ok(bundle.segment_count)
            }
            None => Ok(0),
        }
    }

    /// Wait for the next datagram and return its sender.
    pub async fn receive_begin(&mut self) -> TransportResult<SocketAddr> {
        let (len, sender) = self
            .socket
            .recv_from(&mut self.receive_buffer)
            .await
            .map_err(map_io)?;
        self.received_len = len;
        Ok(sender)
    }

    /// Split the datagram from [`receive_begin`](Self::receive_begin).
    ///
    /// Segments are appended to `segments` and acknowledged bundle
    /// sequences to `acks`. On error nothing is appended.
    pub fn receive_end(
        &mut self,
        pool: &SegmentPool,
        segments: &mut Vec<PooledSegment>,
        acks: &mut Vec<u32>,
        statistics: &NetworkStatistics,
        now: Duration,
    ) -> TransportResult<()> {
        let len = std::mem::take(&mut self.received_len);
        if self.receive_loss > 0.0 && rand::thread_rng().gen_bool(self.receive_loss) {
            return Err(TransportError::SimulatedLoss);
        }

        let datagram = &self.receive_buffer[..len];
        let header = BundleHeader::parse(datagram)?;

        if !self.ignore_salt_mismatch {
            if header.salt == 0 {
                return Err(TransportError::SaltMissing);
            }
            let expected = statistics.adopt_remote_salt(header.salt);
            if expected != header.salt {
                return Err(TransportError::SaltMismatch {
                    expected,
                    actual: header.salt,
                });
            }
        }

        let count = header.segment_count as usize;
        let start = segments.len();
        if pool.request_free_segments(count, segments).is_err() {
            return Err(TransportError::PoolExhausted { needed: count });
        }

        for (i, item) in BundleSegments::new(datagram, &header).enumerate() {
            match item {
                Ok((segment_header, payload)) => {
                    segments[start + i].load(segment_header, payload, header.salt);
                }
                Err(e) => {
                    segments.truncate(start);
                    return Err(e.into());
                }
            }
        }

        if !self.ignore_salt_mismatch && !statistics.record_received_sequence(header.sequence) {
            segments.truncate(start);
            debug!(sequence = header.sequence, "duplicate bundle dropped");
            return Err(TransportError::DuplicateBundle {
                sequence: header.sequence,
            });
        }

        acks.extend(header.acked_sequences());
        statistics.register_packet_received(count, len, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{BinaryDecoder, BinaryEncoder, SegmentType};
    use crate::transport::memory::{MemoryNetwork, MemorySocket};

    fn pair() -> (Arc<MemorySocket>, Arc<MemorySocket>) {
        let network = MemoryNetwork::new();
        let a = network.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = network.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        (Arc::new(a), Arc::new(b))
    }

    #[tokio::test]
    async fn test_transmit_and_receive() {
        let (a, b) = pair();
        let target = b.local_addr().unwrap();
        let pool = SegmentPool::new(8);
        let tx_stats = NetworkStatistics::new();
        let rx_stats = NetworkStatistics::new();

        let mut queue = VecDeque::new();
        for value in 0..3u32 {
            let mut segment = pool.request_free_segment().unwrap();
            segment.set_type(SegmentType(value as u16));
            BinaryEncoder::new(&mut segment).write_u32(value * 10);
            queue.push_back(segment);
        }

        let mut tx = PacketTransceiver::new(a);
        let sent = tx
            .transmit(&mut queue, target, &tx_stats, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(sent, 3);
        assert!(queue.is_empty());
        assert_eq!(pool.free_count(), 8);
        assert_eq!(tx_stats.packets_sent(), 1);

        let mut rx = PacketTransceiver::new(b.clone());
        rx.receive_begin().await.unwrap();
        let mut segments = Vec::new();
        let mut acks = Vec::new();
        rx.receive_end(&pool, &mut segments, &mut acks, &rx_stats, Duration::ZERO)
            .unwrap();

        assert_eq!(segments.len(), 3);
        assert!(acks.is_empty());
        for (value, segment) in segments.iter().enumerate() {
            assert_eq!(segment.segment_type(), SegmentType(value as u16));
            assert_eq!(segment.remote_salt(), tx_stats.salt());
            let mut decoder = BinaryDecoder::new(segment);
            assert_eq!(decoder.read_u32().unwrap(), value as u32 * 10);
        }
        assert_eq!(rx_stats.remote_salt(), tx_stats.salt());
        assert_eq!(rx_stats.ack_window(), (1, 0));
        assert_eq!(b.sent_datagrams(), 0);
    }

    #[tokio::test]
    async fn test_salt_mismatch_is_rejected() {
        let (a, b) = pair();
        let target = b.local_addr().unwrap();
        let pool = SegmentPool::new(4);
        let rx_stats = NetworkStatistics::new();
        let mut tx = PacketTransceiver::new(a);
        let mut rx = PacketTransceiver::new(b);
        let mut segments = Vec::new();
        let mut acks = Vec::new();

        for _ in 0..2 {
            // A fresh sender per round stands in for a spoofer.
            let stats = NetworkStatistics::new();
            let mut queue = VecDeque::from([pool.request_free_segment().unwrap()]);
            tx.transmit(&mut queue, target, &stats, Duration::ZERO)
                .await
                .unwrap();
        }

        rx.receive_begin().await.unwrap();
        rx.receive_end(&pool, &mut segments, &mut acks, &rx_stats, Duration::ZERO)
            .unwrap();
        assert_eq!(segments.len(), 1);

        rx.receive_begin().await.unwrap();
        let err = rx
            .receive_end(&pool, &mut segments, &mut acks, &rx_stats, Duration::ZERO)
            .unwrap_err();
        assert!(err.is_spoof_suspect());
        assert_eq!(segments.len(), 1);
        assert_eq!(pool.free_count(), 3);
    }

    #[tokio::test]
    async fn test_ignore_salt_mismatch() {
        let (a, b) = pair();
        let target = b.local_addr().unwrap();
        let pool = SegmentPool::new(4);
        let rx_stats = NetworkStatistics::new();
        let mut tx = PacketTransceiver::new(a);
        let mut rx = PacketTransceiver::new(b);
        rx.set_ignore_salt_mismatch(true);

        for _ in 0..2 {
            let stats = NetworkStatistics::new();
            let mut queue = VecDeque::from([pool.request_free_segment().unwrap()]);
            tx.transmit(&mut queue, target, &stats, Duration::ZERO)
                .await
                .unwrap();
        }

        let mut segments = Vec::new();
        let mut acks = Vec::new();
        for _ in 0..2 {
            rx.receive_begin().await.unwrap();
            rx.receive_end(&pool, &mut segments, &mut acks, &rx_stats, Duration::ZERO)
                .unwrap();
        }
        assert_eq!(segments.len(), 2);
        assert_ne!(segments[0].remote_salt(), segments[1].remote_salt());
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_dropped() {
        let (a, b) = pair();
        let pool = SegmentPool::new(2);
        let stats = NetworkStatistics::new();
        a.send_to(&[1, 2, 3, 4, 5], b.local_addr().unwrap())
            .await
            .unwrap();

        let mut rx = PacketTransceiver::new(b);
        rx.receive_begin().await.unwrap();
        let mut segments = Vec::new();
        let mut acks = Vec::new();
        let err = rx
            .receive_end(&pool, &mut segments, &mut acks, &stats, Duration::ZERO)
            .unwrap_err();
        assert!(err.is_silent_drop());
        assert!(segments.is_empty());
        assert_eq!(pool.free_count(), 2);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_drops_datagram() {
        let (a, b) = pair();
        let target = b.local_addr().unwrap();
        let tx_pool = SegmentPool::new(4);
        let rx_pool = SegmentPool::new(1);
        let stats = NetworkStatistics::new();
        let mut queue: VecDeque<_> = (0..2)
            .map(|_| tx_pool.request_free_segment().unwrap())
            .collect();
        let mut tx = PacketTransceiver::new(a);
        tx.transmit(&mut queue, target, &stats, Duration::ZERO)
            .await
            .unwrap();

        let mut rx = PacketTransceiver::new(b);
        rx.receive_begin().await.unwrap();
        let mut segments = Vec::new();
        let mut acks = Vec::new();
        let err = rx
            .receive_end(&rx_pool, &mut segments, &mut acks, &NetworkStatistics::new(), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, TransportError::PoolExhausted { needed: 2 }));
        assert_eq!(rx_pool.free_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_bundle_is_dropped() {
        let (a, b) = pair();
        let target = b.local_addr().unwrap();
        let pool = SegmentPool::new(4);
        let tx_stats = NetworkStatistics::new();
        let rx_stats = NetworkStatistics::new();
        let mut tx = PacketTransceiver::new(a.clone());
        let mut queue = VecDeque::from([pool.request_free_segment().unwrap()]);
        let bundle = tx
            .encode(&tx_stats, |writer| {
                writer.push(&queue[0]);
            })
            .unwrap();
        queue.clear();
        tx.send_encoded(bundle, target, &tx_stats, Duration::ZERO)
            .await
            .unwrap();
        tx.send_encoded(bundle, target, &tx_stats, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(a.sent_datagrams(), 2);

        let mut rx = PacketTransceiver::new(b);
        let mut segments = Vec::new();
        let mut acks = Vec::new();
        rx.receive_begin().await.unwrap();
        rx.receive_end(&pool, &mut segments, &mut acks, &rx_stats, Duration::ZERO)
            .unwrap();
        rx.receive_begin().await.unwrap();
        let err = rx
            .receive_end(&pool, &mut segments, &mut acks, &rx_stats, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, TransportError::DuplicateBundle { sequence: 1 }));
        assert_eq!(segments.len(), 1);
    }

    #[tokio::test]
    async fn test_total_simulated_receive_loss() {
        let (a, b) = pair();
        let target = b.local_addr().unwrap();
        let pool = SegmentPool::new(2);
        let stats = NetworkStatistics::new();
        let mut tx = PacketTransceiver::new(a);
        let mut queue = VecDeque::from([pool.request_free_segment().unwrap()]);
        tx.transmit(&mut queue, target, &stats, Duration::ZERO)
            .await
            .unwrap();

        let mut rx = PacketTransceiver::new(b);
        rx.set_simulated_loss(0.0, 1.0);
        rx.receive_begin().await.unwrap();
        let err = rx
            .receive_end(&pool, &mut Vec::new(), &mut Vec::new(), &stats, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, TransportError::SimulatedLoss));
    }
}
