//! Connection initiator.
//!
//! A [`Client`] binds a socket, runs the handshake against one server and
//! then carries reliable and unreliable segments both ways. Socket I/O runs
//! on two tokio tasks; the application drives timers through
//! [`Client::tick`] and reads [`ConnectionEvent`]s.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{
    Connection, ConnectionEvent, ConnectionState, DisconnectReason, Worker, challenge_answer,
};
use crate::core::constants::{
    DEFAULT_SERVER_PORT, DEFAULT_TRANSMIT_INTERVAL, HANDSHAKE_MAX_RETRIES, HANDSHAKE_TIMEOUT,
};
use crate::core::{PacketListener, TransportContext};
use crate::segment::{BinaryDecoder, PooledSegment, Segment, SegmentType};
use crate::transport::{
    DatagramSocket, NetworkStatistics, PacketManagerConfig, PacketTransceiver, TickReport,
    UdpDatagramSocket,
};

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection is not open for application traffic.
    #[error("not connected ({0})")]
    NotConnected(ConnectionState),

    /// Application segments may not use reserved types.
    #[error("segment type {0} is reserved")]
    ReservedType(SegmentType),

    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No tokio runtime to run the socket tasks on.
    #[error("client must be created inside a tokio runtime")]
    NoRuntime,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address to connect to.
    pub server_addr: SocketAddr,

    /// Local address to bind.
    pub bind_addr: SocketAddr,

    /// Reliability settings.
    pub packet_manager: PacketManagerConfig,

    /// Heartbeat period of the transmitter task.
    pub transmit_interval: Duration,

    /// Handshake step resend period.
    pub handshake_timeout: Duration,

    /// Handshake resends before giving up.
    pub handshake_max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVER_PORT)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            packet_manager: PacketManagerConfig::default(),
            transmit_interval: DEFAULT_TRANSMIT_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            handshake_max_retries: HANDSHAKE_MAX_RETRIES,
        }
    }
}

impl ClientConfig {
    fn validate(&self) -> Result<(), ClientError> {
        if self.transmit_interval.is_zero() {
            return Err(ClientError::InvalidConfig(
                "transmit_interval must be non-zero".into(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ClientError::InvalidConfig(
                "handshake_timeout must be non-zero".into(),
            ));
        }
        if self.packet_manager.pool_size == 0 {
            return Err(ClientError::InvalidConfig("pool_size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Set the server address.
    pub fn server_addr(mut self, addr: SocketAddr) -> Self {
        self.config.server_addr = addr;
        self
    }

    /// Set the local bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the reliability settings.
    pub fn packet_manager(mut self, config: PacketManagerConfig) -> Self {
        self.config.packet_manager = config;
        self
    }

    /// Set the transmitter heartbeat.
    pub fn transmit_interval(mut self, interval: Duration) -> Self {
        self.config.transmit_interval = interval;
        self
    }

    /// Set the handshake resend period.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the handshake resend limit.
    pub fn handshake_max_retries(mut self, retries: u32) -> Self {
        self.config.handshake_max_retries = retries;
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum HandshakeStage {
    AwaitingChallenge,
    AwaitingAccepted { answer: u64 },
}

#[derive(Debug)]
struct Handshake {
    stage: HandshakeStage,
    since_sent: Duration,
    resends: u32,
}

struct ClientInner<S> {
    config: ClientConfig,
    socket: Arc<S>,
    connection: Connection,
    worker: Worker,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
    handshake: Mutex<Handshake>,
}

impl<S: DatagramSocket> ClientInner<S> {
    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            // A dropped receiver just means nobody is listening.
            let _ = events.send(event);
        }
    }

    fn close(&self, reason: DisconnectReason, notify_peer: bool) -> bool {
        if !self.connection.close(reason, notify_peer) {
            return false;
        }
        self.emit(ConnectionEvent::Disconnecting(reason));
        self.emit(ConnectionEvent::Disconnected(reason));
        self.worker.stop();
        true
    }

    fn send_handshake(&self, stage: HandshakeStage) {
        let queued = match stage {
            HandshakeStage::AwaitingChallenge => {
                self.connection.send_control(SegmentType::CONNECT, |_| {})
            }
            HandshakeStage::AwaitingAccepted { answer } => {
                self.connection.send_control(SegmentType::CHALLENGE, |encoder| {
                    encoder.write_u64(answer);
                })
            }
        };
        if queued {
            self.worker.wake();
        }
    }

    fn tick_handshake(&self, delta: Duration) {
        if self.connection.state() != ConnectionState::Connecting {
            return;
        }
        let resend = {
            let mut handshake = self.handshake.lock();
            handshake.since_sent += delta;
            if handshake.since_sent < self.config.handshake_timeout {
                return;
            }
            handshake.since_sent = Duration::ZERO;
            handshake.resends += 1;
            (handshake.resends <= self.config.handshake_max_retries).then_some(handshake.stage)
        };

        match resend {
            Some(stage) => {
                debug!(server = %self.config.server_addr, ?stage, "resending handshake");
                self.send_handshake(stage);
            }
            None => {
                warn!(server = %self.config.server_addr, "handshake timed out");
                self.close(DisconnectReason::HandshakeTimeout, true);
            }
        }
    }

    fn on_challenge(&self, segment: &Segment) {
        if self.connection.state() != ConnectionState::Connecting {
            return;
        }
        let Ok(server_salt) = BinaryDecoder::new(segment).read_u64() else {
            warn!(server = %self.config.server_addr, "malformed challenge");
            return;
        };
        let answer = challenge_answer(server_salt, self.connection.statistics().salt());
        let stage = HandshakeStage::AwaitingAccepted { answer };
        {
            let mut handshake = self.handshake.lock();
            handshake.stage = stage;
            handshake.since_sent = Duration::ZERO;
            handshake.resends = 0;
        }
        self.send_handshake(stage);
    }

    fn dispatch(&self, segment: PooledSegment) {
        match segment.segment_type() {
            SegmentType::CHALLENGE => self.on_challenge(&segment),
            SegmentType::ACCEPTED => {
                if self.connection.mark_connected() {
                    self.emit(ConnectionEvent::Connected);
                }
            }
            SegmentType::SERVER_FULL => {
                self.close(DisconnectReason::ServerFull, false);
            }
            SegmentType::SERVER_NOT_ACCEPTING => {
                self.close(DisconnectReason::ServerNotAccepting, false);
            }
            SegmentType::DISCONNECT => {
                self.close(DisconnectReason::Remote, false);
            }
            segment_type if segment_type.is_reserved() => {
                trace!(%segment_type, "ignoring control segment");
            }
            _ if self.connection.state().is_connected() => {
                self.emit(ConnectionEvent::Received(segment));
            }
            segment_type => {
                trace!(%segment_type, state = %self.connection.state(), "dropping segment outside connection");
            }
        }
    }
}

async fn receive_loop<S: DatagramSocket>(inner: Arc<ClientInner<S>>) {
    let mut transceiver = PacketTransceiver::new(inner.socket.clone());
    let mut shutdown = inner.worker.shutdown();
    let mut received = Vec::new();

    while inner.worker.is_running() {
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = transceiver.receive_begin() => result,
        };
        let sender = match result {
            Ok(sender) => sender,
            Err(e) => {
                if inner.worker.is_running() {
                    error!(error = %e, "client receive failed");
                    inner.close(DisconnectReason::SocketError, false);
                }
                break;
            }
        };
        if sender != inner.config.server_addr {
            trace!(%sender, "datagram from unexpected sender");
            continue;
        }

        match inner
            .connection
            .manager()
            .query_begin(&mut transceiver, &mut received)
        {
            Ok(outcome) => {
                if outcome.ack_queued {
                    inner.worker.wake();
                }
            }
            Err(e) if e.is_silent_drop() => {
                debug!(error = %e, "dropped datagram");
                continue;
            }
            Err(e) => {
                error!(error = %e, "client receive failed");
                inner.close(DisconnectReason::SocketError, false);
                break;
            }
        }
        for segment in received.drain(..) {
            inner.dispatch(segment);
        }
    }
    debug!("client receiver stopped");
}

async fn transmit_loop<S: DatagramSocket>(inner: Arc<ClientInner<S>>) {
    let mut transceiver = PacketTransceiver::new(inner.socket.clone());
    let mut shutdown = inner.worker.shutdown();
    let mut heartbeat = tokio::time::interval(inner.config.transmit_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while inner.worker.is_running() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = inner.worker.woken() => {}
            _ = heartbeat.tick() => {}
        }
        if let Err(e) = inner.connection.manager().flush(&mut transceiver).await {
            if e.is_fatal() {
                error!(error = %e, "client transmit failed");
                inner.close(DisconnectReason::SocketError, false);
                break;
            }
            debug!(error = %e, "transmit error");
        }
    }

    // A DISCONNECT queued by the close path still has to leave.
    if let Err(e) = inner.connection.manager().flush(&mut transceiver).await {
        debug!(error = %e, "final flush failed");
    }
    debug!("client transmitter stopped");
}

/// A connection to one server.
///
/// # Example
///
/// ```ignore
/// use tether_net::client::{Client, ClientBuilder};
/// use tether_net::connection::ConnectionEvent;
///
/// let config = ClientBuilder::new()
///     .server_addr("192.168.1.20:4451".parse()?)
///     .build();
/// let mut client = Client::connect(config).await?;
///
/// loop {
///     client.tick(frame_time);
///     while let Some(event) = client.poll_event() {
///         match event {
///             ConnectionEvent::Received(segment) => handle(&segment),
///             ConnectionEvent::Disconnected(reason) => return Err(reason.into()),
///             _ => {}
///         }
///     }
/// }
/// ```
pub struct Client<S: DatagramSocket = UdpDatagramSocket> {
    inner: Arc<ClientInner<S>>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Client<UdpDatagramSocket> {
    /// Bind a UDP socket and start connecting to `config.server_addr`.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let socket = UdpDatagramSocket::bind(config.bind_addr).await?;
        Self::with_socket(config, TransportContext::new(), socket)
    }
}

impl<S: DatagramSocket> Client<S> {
    /// Start connecting over an already bound socket.
    ///
    /// Must be called inside a tokio runtime; the socket tasks are
    /// spawned on it.
    pub fn with_socket(
        config: ClientConfig,
        context: TransportContext,
        socket: S,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| ClientError::NoRuntime)?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            connection: Connection::new(config.packet_manager, context, config.server_addr),
            socket: Arc::new(socket),
            worker: Worker::new(),
            events: Mutex::new(Some(events_tx)),
            handshake: Mutex::new(Handshake {
                stage: HandshakeStage::AwaitingChallenge,
                since_sent: Duration::ZERO,
                resends: 0,
            }),
            config,
        });

        info!(server = %inner.config.server_addr, "connecting");
        inner.send_handshake(HandshakeStage::AwaitingChallenge);
        inner.worker.spawn(receive_loop(inner.clone()));
        inner.worker.spawn(transmit_loop(inner.clone()));

        Ok(Self { inner, events })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Check if the handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// The server address.
    pub fn server_addr(&self) -> SocketAddr {
        self.inner.config.server_addr
    }

    /// The local socket address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Connection statistics.
    pub fn statistics(&self) -> &NetworkStatistics {
        self.inner.connection.statistics()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Borrow a segment from this connection's pool.
    ///
    /// Returns `None` when the pool is exhausted; skip this frame's sends.
    pub fn request_segment(&self, segment_type: SegmentType) -> Option<PooledSegment> {
        self.inner.connection.manager().request_segment(segment_type)
    }

    fn check_sendable(&self, segment: &Segment) -> Result<(), ClientError> {
        let segment_type = segment.segment_type();
        if segment_type.is_reserved() {
            return Err(ClientError::ReservedType(segment_type));
        }
        let state = self.state();
        if !state.is_connected() {
            return Err(ClientError::NotConnected(state));
        }
        Ok(())
    }

    /// Queue a segment for ordered, acknowledged delivery.
    ///
    /// `listener` hears when it is delivered, resent or given up on.
    pub fn send_reliable(
        &self,
        segment: PooledSegment,
        listener: Option<Arc<dyn PacketListener>>,
    ) -> Result<u32, ClientError> {
        self.check_sendable(&segment)?;
        let uid = self
            .inner
            .connection
            .manager()
            .enqueue_segment_reliable(segment, listener);
        self.inner.worker.wake();
        Ok(uid)
    }

    /// Queue a segment for best-effort delivery.
    pub fn send_unreliable(&self, segment: PooledSegment) -> Result<u32, ClientError> {
        self.check_sendable(&segment)?;
        let uid = self
            .inner
            .connection
            .manager()
            .enqueue_segment_unreliable(segment);
        self.inner.worker.wake();
        Ok(uid)
    }

    /// Advance resend and handshake timers by `delta`.
    ///
    /// Disconnects with [`DisconnectReason::MaxRetries`] when a reliable
    /// segment runs out of retransmissions.
    pub fn tick(&self, delta: Duration) -> TickReport {
        let report = self.inner.connection.manager().tick(delta);
        if report.resent > 0 {
            self.inner.worker.wake();
        }
        if report.max_tries_reached > 0 {
            self.inner.close(DisconnectReason::MaxRetries, true);
        }
        self.inner.tick_handshake(delta);
        report
    }

    /// Next pending event, without waiting.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the client has been released and every
    /// buffered event has been read.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Start the disconnect protocol. Returns `false` if already closing.
    pub fn disconnect(&self) -> bool {
        self.inner.close(DisconnectReason::Local, true)
    }

    /// Disconnect, stop both socket tasks and close the socket.
    ///
    /// Safe to call more than once.
    pub async fn release(&self) {
        self.disconnect();
        self.inner.worker.stop();
        self.inner.worker.join().await;
        self.inner.socket.close();
        self.inner.events.lock().take();
    }
}

impl<S: DatagramSocket> Drop for Client<S> {
    fn drop(&mut self) {
        self.inner.worker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, MemorySocket, PacketManager};

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    async fn next_event<S: DatagramSocket>(client: &mut Client<S>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(2), client.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Hand-driven responder: one manager plus both transceivers.
    struct Responder {
        socket: Arc<MemorySocket>,
        manager: PacketManager,
        tx: PacketTransceiver<MemorySocket>,
        rx: PacketTransceiver<MemorySocket>,
    }

    impl Responder {
        fn new(socket: MemorySocket, client: SocketAddr) -> Self {
            let socket = Arc::new(socket);
            Self {
                manager: PacketManager::new(PacketManagerConfig::default(), TransportContext::new(), client),
                tx: PacketTransceiver::new(socket.clone()),
                rx: PacketTransceiver::new(socket.clone()),
                socket,
            }
        }

        async fn receive(&mut self) -> Vec<PooledSegment> {
            let socket = self.socket.clone();
            assert!(wait_until(|| socket.pending() > 0).await, "nothing received");
            let mut out = Vec::new();
            while self.socket.pending() > 0 {
                self.rx.receive_begin().await.unwrap();
                self.manager.query_begin(&mut self.rx, &mut out).unwrap();
            }
            out
        }

        async fn send(&mut self, segment_type: SegmentType, payload: Option<u64>) {
            let mut segment = self.manager.request_segment(segment_type).unwrap();
            if let Some(value) = payload {
                crate::segment::BinaryEncoder::new(&mut segment).write_u64(value);
            }
            self.manager.enqueue_segment_unreliable(segment);
            self.manager.flush(&mut self.tx).await.unwrap();
        }
    }

    fn setup() -> (MemoryNetwork, MemorySocket, ClientConfig) {
        let network = MemoryNetwork::new();
        let server = network.bind("127.0.0.1:4451".parse().unwrap()).unwrap();
        let config = ClientBuilder::new()
            .server_addr(server.local_addr().unwrap())
            .transmit_interval(Duration::from_millis(10))
            .handshake_max_retries(2)
            .build();
        (network, server, config)
    }

    #[tokio::test]
    async fn test_handshake_against_scripted_responder() {
        let (network, server_socket, config) = setup();
        let socket = network.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client_addr = socket.local_addr().unwrap();
        let mut client = Client::with_socket(config, TransportContext::new(), socket).unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);

        let mut responder = Responder::new(server_socket, client_addr);
        let received = responder.receive().await;
        assert_eq!(received[0].segment_type(), SegmentType::CONNECT);
        drop(received);

        let server_salt = responder.manager.statistics().salt();
        responder.send(SegmentType::CHALLENGE, Some(server_salt)).await;

        let received = responder.receive().await;
        assert_eq!(received[0].segment_type(), SegmentType::CHALLENGE);
        let answer = BinaryDecoder::new(&received[0]).read_u64().unwrap();
        let client_salt = responder.manager.statistics().remote_salt();
        assert_eq!(answer, challenge_answer(server_salt, client_salt));
        assert_eq!(client_salt, client.statistics().salt());
        drop(received);

        responder.send(SegmentType::ACCEPTED, None).await;
        assert!(matches!(next_event(&mut client).await, ConnectionEvent::Connected));
        assert!(client.is_connected());

        // A second ACCEPTED is not a second connection.
        responder.send(SegmentType::ACCEPTED, None).await;
        responder.send(SegmentType(3), Some(99)).await;
        match next_event(&mut client).await {
            ConnectionEvent::Received(segment) => {
                assert_eq!(BinaryDecoder::new(&segment).read_u64().unwrap(), 99);
            }
            other => panic!("unexpected event {other:?}"),
        }

        client.disconnect();
        let received = responder.receive().await;
        assert!(received.iter().any(|s| s.segment_type() == SegmentType::DISCONNECT));
        client.release().await;
    }

    #[tokio::test]
    async fn test_handshake_timeout_after_retries() {
        let (network, server_socket, config) = setup();
        let socket = network.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut client = Client::with_socket(config, TransportContext::new(), socket).unwrap();

        assert!(wait_until(|| server_socket.pending() == 1).await);
        for expected in 2..=3 {
            client.tick(HANDSHAKE_TIMEOUT);
            assert!(wait_until(|| server_socket.pending() == expected).await);
        }
        assert_eq!(client.state(), ConnectionState::Connecting);

        client.tick(HANDSHAKE_TIMEOUT);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            next_event(&mut client).await,
            ConnectionEvent::Disconnecting(DisconnectReason::HandshakeTimeout)
        ));
        assert!(matches!(
            next_event(&mut client).await,
            ConnectionEvent::Disconnected(DisconnectReason::HandshakeTimeout)
        ));
        client.release().await;
    }

    #[tokio::test]
    async fn test_server_full_ends_connection() {
        let (network, server_socket, config) = setup();
        let socket = network.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client_addr = socket.local_addr().unwrap();
        let mut client = Client::with_socket(config, TransportContext::new(), socket).unwrap();

        let mut responder = Responder::new(server_socket, client_addr);
        responder.receive().await;
        responder.send(SegmentType::SERVER_FULL, None).await;

        assert!(matches!(
            next_event(&mut client).await,
            ConnectionEvent::Disconnecting(DisconnectReason::ServerFull)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.release().await;
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (network, _server, config) = setup();
        let socket = network.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = Client::with_socket(config, TransportContext::new(), socket).unwrap();

        let segment = client.request_segment(SegmentType(1)).unwrap();
        assert!(matches!(
            client.send_unreliable(segment),
            Err(ClientError::NotConnected(ConnectionState::Connecting))
        ));

        let segment = client.request_segment(SegmentType::PING).unwrap();
        assert!(matches!(
            client.send_reliable(segment, None),
            Err(ClientError::ReservedType(SegmentType::PING))
        ));
        client.release().await;
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (network, server_socket, config) = setup();
        let socket = network.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut client = Client::with_socket(config, TransportContext::new(), socket).unwrap();

        client.release().await;
        client.release().await;
        assert!(!client.disconnect());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let mut events = Vec::new();
        while let Some(event) = client.next_event().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ConnectionEvent::Disconnected(DisconnectReason::Local)));

        // CONNECT and one DISCONNECT went out, nothing more.
        let disconnects = {
            let mut responder = Responder::new(server_socket, client.local_addr().unwrap());
            responder
                .receive()
                .await
                .iter()
                .filter(|s| s.segment_type() == SegmentType::DISCONNECT)
                .count()
        };
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_config_validation() {
        let config = ClientBuilder::new().transmit_interval(Duration::ZERO).build();
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_requires_runtime() {
        let network = MemoryNetwork::new();
        let socket = network.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let result = Client::with_socket(ClientConfig::default(), TransportContext::new(), socket);
        assert!(matches!(result, Err(ClientError::NoRuntime)));
    }
}
