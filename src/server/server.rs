//! Connection responder.
//!
//! A [`Server`] owns one socket shared by every client. Its receiver task
//! routes datagrams to the matching [`RemoteClient`] by source address and
//! admits new clients; its transmitter task flushes every client's queue.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use super::remote::{AnswerOutcome, RemoteClient};
use crate::connection::{ConnectionState, DisconnectReason, Worker};
use crate::core::constants::{
    ADMISSION_POOL_SIZE, DEFAULT_MAX_CLIENTS, DEFAULT_SERVER_PORT, DEFAULT_TRANSMIT_INTERVAL,
};
use crate::core::{PacketListener, TransportContext};
use crate::segment::{BinaryEncoder, PooledSegment, Segment, SegmentPool, SegmentType};
use crate::transport::{
    DatagramSocket, NetworkStatistics, PacketManagerConfig, PacketTransceiver, TickReport,
    TransportError, UdpDatagramSocket,
};

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No client at this address.
    #[error("unknown client {0}")]
    UnknownClient(SocketAddr),

    /// The client has not completed the handshake or is closing.
    #[error("client {client} is not connected ({state})")]
    NotConnected {
        /// Client address.
        client: SocketAddr,
        /// Its current state.
        state: ConnectionState,
    },

    /// Application segments may not use reserved types.
    #[error("segment type {0} is reserved")]
    ReservedType(SegmentType),

    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No tokio runtime to run the socket tasks on.
    #[error("server must be created inside a tokio runtime")]
    NoRuntime,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Maximum number of connected clients.
    pub max_clients: u8,

    /// Reliability settings for every client.
    pub packet_manager: PacketManagerConfig,

    /// Heartbeat period of the transmitter task.
    pub transmit_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)),
            max_clients: DEFAULT_MAX_CLIENTS,
            packet_manager: PacketManagerConfig::default(),
            transmit_interval: DEFAULT_TRANSMIT_INTERVAL,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ServerError> {
        if self.transmit_interval.is_zero() {
            return Err(ServerError::InvalidConfig(
                "transmit_interval must be non-zero".into(),
            ));
        }
        if self.packet_manager.pool_size == 0 {
            return Err(ServerError::InvalidConfig("pool_size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the maximum number of connected clients.
    pub fn max_clients(mut self, max: u8) -> Self {
        self.config.max_clients = max;
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

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Event from the server.
#[derive(Debug)]
pub enum ServerEvent {
    /// A CONNECT arrived and a handler was created.
    ClientConnecting(SocketAddr),

    /// A client answered the challenge.
    ClientConnected(SocketAddr),

    /// An application segment arrived from a client.
    Received {
        /// Sender.
        client: SocketAddr,
        /// The segment; dropping it returns it to the client's pool.
        segment: PooledSegment,
    },

    /// A client connection started closing.
    ClientDisconnecting {
        /// Client address.
        client: SocketAddr,
        /// Why.
        reason: DisconnectReason,
    },

    /// A client connection closed.
    ClientDisconnected {
        /// Client address.
        client: SocketAddr,
        /// Why.
        reason: DisconnectReason,
    },
}

/// Scratch state for datagrams from endpoints without a handler.
struct Admission {
    pool: SegmentPool,
    statistics: NetworkStatistics,
    segments: Vec<PooledSegment>,
    acks: Vec<u32>,
}

impl Admission {
    fn new() -> Self {
        Self {
            pool: SegmentPool::new(ADMISSION_POOL_SIZE),
            statistics: NetworkStatistics::new(),
            segments: Vec::new(),
            acks: Vec::new(),
        }
    }
}

type ClientList = SmallVec<[Arc<RemoteClient>; 16]>;

struct ServerInner<S> {
    config: ServerConfig,
    context: TransportContext,
    socket: Arc<S>,
    clients: RwLock<HashMap<SocketAddr, Arc<RemoteClient>>>,
    accepting: AtomicBool,
    worker: Worker,
    events: Mutex<Option<mpsc::UnboundedSender<ServerEvent>>>,
}

impl<S: DatagramSocket> ServerInner<S> {
    fn emit(&self, event: ServerEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    fn snapshot(&self) -> ClientList {
        self.clients.read().values().cloned().collect()
    }

    fn drop_client(&self, remote: &RemoteClient, reason: DisconnectReason, notify_peer: bool) -> bool {
        if !remote.connection().close(reason, notify_peer) {
            return false;
        }
        let client = remote.endpoint();
        self.emit(ServerEvent::ClientDisconnecting { client, reason });
        self.emit(ServerEvent::ClientDisconnected { client, reason });
        self.worker.wake();
        true
    }

    fn drop_all(&self, reason: DisconnectReason, notify_peer: bool) {
        for remote in self.snapshot() {
            self.drop_client(&remote, reason, notify_peer);
        }
    }

    /// Forget clients whose DISCONNECT has left.
    fn prune(&self) {
        self.clients.write().retain(|_, remote| {
            remote.state() != ConnectionState::Disconnected
                || remote.connection().manager().has_pending_output()
        });
    }

    async fn reply(
        &self,
        transceiver: &mut PacketTransceiver<S>,
        admission: &Admission,
        target: SocketAddr,
        segment_type: SegmentType,
    ) {
        let Some(mut segment) = admission.pool.request_free_segment() else {
            return;
        };
        segment.set_type(segment_type);
        let Some(bundle) = transceiver.encode(&admission.statistics, |writer| {
            writer.push(&segment);
        }) else {
            return;
        };
        let now = self.context.now();
        if let Err(e) = transceiver
            .send_encoded(bundle, target, &admission.statistics, now)
            .await
        {
            debug!(%target, error = %e, "admission reply failed");
        }
    }

    /// Handle a datagram from an endpoint without a handler.
    async fn admit(
        &self,
        transceiver: &mut PacketTransceiver<S>,
        sender: SocketAddr,
        admission: &mut Admission,
    ) {
        let now = self.context.now();
        transceiver.set_ignore_salt_mismatch(true);
        let result = transceiver.receive_end(
            &admission.pool,
            &mut admission.segments,
            &mut admission.acks,
            &admission.statistics,
            now,
        );
        transceiver.set_ignore_salt_mismatch(false);
        admission.acks.clear();
        if let Err(e) = result {
            debug!(%sender, error = %e, "dropped datagram from unknown endpoint");
            return;
        }

        let connect_salt = admission
            .segments
            .iter()
            .find(|segment| segment.segment_type() == SegmentType::CONNECT)
            .map(|segment| segment.remote_salt());
        admission.segments.clear();
        let Some(salt) = connect_salt else {
            trace!(%sender, "ignoring datagram from unknown endpoint");
            return;
        };
        if salt == 0 {
            debug!(%sender, "connect without salt dropped");
            return;
        }

        if !self.accepting.load(Ordering::Acquire) {
            info!(client = %sender, "refusing client: not accepting");
            self.reply(transceiver, admission, sender, SegmentType::SERVER_NOT_ACCEPTING)
                .await;
            return;
        }

        let admitted = {
            let mut clients = self.clients.write();
            let active = clients
                .values()
                .filter(|remote| !remote.state().is_closing())
                .count();
            if active >= usize::from(self.config.max_clients) {
                None
            } else {
                let remote = Arc::new(RemoteClient::new(
                    self.config.packet_manager,
                    self.context.clone(),
                    sender,
                    salt,
                ));
                clients.insert(sender, remote.clone());
                Some(remote)
            }
        };
        let Some(remote) = admitted else {
            info!(client = %sender, "refusing client: server full");
            self.reply(transceiver, admission, sender, SegmentType::SERVER_FULL)
                .await;
            return;
        };

        info!(client = %sender, "client connecting");
        self.emit(ServerEvent::ClientConnecting(sender));
        if remote.on_connect() {
            self.worker.wake();
        }
    }

    fn dispatch(&self, remote: &RemoteClient, segment: PooledSegment) {
        match segment.segment_type() {
            SegmentType::CONNECT => {
                if remote.on_connect() {
                    self.worker.wake();
                }
            }
            SegmentType::CHALLENGE => match remote.on_answer(&segment) {
                AnswerOutcome::Accepted { first } => {
                    if first {
                        self.emit(ServerEvent::ClientConnected(remote.endpoint()));
                    }
                    self.worker.wake();
                }
                AnswerOutcome::Rejected | AnswerOutcome::Ignored => {}
            },
            SegmentType::DISCONNECT => {
                self.drop_client(remote, DisconnectReason::Remote, false);
            }
            segment_type if segment_type.is_reserved() => {
                trace!(client = %remote.endpoint(), %segment_type, "ignoring control segment");
            }
            _ if remote.state().is_connected() => {
                self.emit(ServerEvent::Received {
                    client: remote.endpoint(),
                    segment,
                });
            }
            segment_type => {
                trace!(client = %remote.endpoint(), %segment_type, "segment before handshake dropped");
            }
        }
    }

    /// Flush every client. Returns `false` once the socket is closed.
    async fn flush_all(&self, transceiver: &mut PacketTransceiver<S>) -> bool {
        for remote in self.snapshot() {
            match remote.connection().manager().flush(transceiver).await {
                Ok(_) => {}
                Err(TransportError::Closed) => return false,
                Err(e) if e.is_fatal() => {
                    error!(client = %remote.endpoint(), error = %e, "send failed");
                    self.drop_client(&remote, DisconnectReason::SocketError, false);
                }
                Err(e) => debug!(client = %remote.endpoint(), error = %e, "transmit error"),
            }
        }
        true
    }
}

async fn receive_loop<S: DatagramSocket>(inner: Arc<ServerInner<S>>) {
    let mut transceiver = PacketTransceiver::new(inner.socket.clone());
    let mut shutdown = inner.worker.shutdown();
    let mut admission = Admission::new();
    let mut received = Vec::new();

    while inner.worker.is_running() {
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = transceiver.receive_begin() => result,
        };
        let sender = match result {
            Ok(sender) => sender,
            // ICMP port unreachable from a vanished client, reported by some platforms.
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                if inner.worker.is_running() {
                    error!(error = %e, "server receive failed");
                    inner.drop_all(DisconnectReason::SocketError, false);
                    inner.worker.stop();
                }
                break;
            }
        };

        let remote = inner.clients.read().get(&sender).cloned();
        let Some(remote) = remote else {
            inner.admit(&mut transceiver, sender, &mut admission).await;
            continue;
        };

        match remote
            .connection()
            .manager()
            .query_begin(&mut transceiver, &mut received)
        {
            Ok(outcome) => {
                if outcome.ack_queued {
                    inner.worker.wake();
                }
            }
            Err(e) if e.is_silent_drop() => {
                if e.is_spoof_suspect() {
                    debug!(client = %sender, error = %e, "datagram failed salt check");
                }
                continue;
            }
            Err(e) => {
                error!(client = %sender, error = %e, "server receive failed");
                continue;
            }
        }
        for segment in received.drain(..) {
            inner.dispatch(&remote, segment);
        }
    }
    debug!("server receiver stopped");
}

async fn transmit_loop<S: DatagramSocket>(inner: Arc<ServerInner<S>>) {
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
        if !inner.flush_all(&mut transceiver).await {
            break;
        }
        inner.prune();
    }

    inner.flush_all(&mut transceiver).await;
    debug!("server transmitter stopped");
}

/// A server accepting connections on one socket.
///
/// # Example
///
/// ```ignore
/// use tether_net::server::{Server, ServerBuilder, ServerEvent};
///
/// let config = ServerBuilder::new().max_clients(8).build();
/// let mut server = Server::bind(config).await?;
///
/// loop {
///     server.tick(frame_time);
///     while let Some(event) = server.poll_event() {
///         if let ServerEvent::Received { client, segment } = event {
///             handle(client, &segment);
///         }
///     }
/// }
/// ```
pub struct Server<S: DatagramSocket = UdpDatagramSocket> {
    inner: Arc<ServerInner<S>>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Server<UdpDatagramSocket> {
    /// Bind a UDP socket and start accepting clients.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let socket = UdpDatagramSocket::bind(config.bind_addr).await?;
        Self::with_socket(config, TransportContext::new(), socket)
    }
}

impl<S: DatagramSocket> Server<S> {
    /// Start accepting clients on an already bound socket.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_socket(
        config: ServerConfig,
        context: TransportContext,
        socket: S,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| ServerError::NoRuntime)?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let inner = Arc::new(ServerInner {
            config,
            context,
            socket: Arc::new(socket),
            clients: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            worker: Worker::new(),
            events: Mutex::new(Some(events_tx)),
        });
        if let Ok(addr) = inner.socket.local_addr() {
            info!(%addr, max_clients = inner.config.max_clients, "server listening");
        }

        inner.worker.spawn(receive_loop(inner.clone()));
        inner.worker.spawn(transmit_loop(inner.clone()));
        Ok(Self { inner, events })
    }

    /// The local socket address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Start or stop admitting new clients.
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.accepting.store(accepting, Ordering::Release);
    }

    /// Check if new clients are admitted.
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Clients that are connecting or connected.
    pub fn client_count(&self) -> usize {
        self.inner
            .clients
            .read()
            .values()
            .filter(|remote| !remote.state().is_closing())
            .count()
    }

    /// Addresses of connected clients.
    pub fn clients(&self) -> Vec<SocketAddr> {
        self.inner
            .clients
            .read()
            .values()
            .filter(|remote| remote.state().is_connected())
            .map(|remote| remote.endpoint())
            .collect()
    }

    /// Handler for the client at `addr`.
    pub fn client(&self, addr: SocketAddr) -> Option<Arc<RemoteClient>> {
        self.inner.clients.read().get(&addr).cloned()
    }

    fn connected_client(&self, addr: SocketAddr, segment: &Segment) -> Result<Arc<RemoteClient>, ServerError> {
        let segment_type = segment.segment_type();
        if segment_type.is_reserved() {
            return Err(ServerError::ReservedType(segment_type));
        }
        let remote = self.client(addr).ok_or(ServerError::UnknownClient(addr))?;
        let state = remote.state();
        if !state.is_connected() {
            return Err(ServerError::NotConnected {
                client: addr,
                state,
            });
        }
        Ok(remote)
    }

    /// Borrow a segment from the pool of the client at `addr`.
    pub fn request_segment(&self, addr: SocketAddr, segment_type: SegmentType) -> Option<PooledSegment> {
        self.client(addr)?
            .connection()
            .manager()
            .request_segment(segment_type)
    }

    /// Queue a segment for ordered, acknowledged delivery to one client.
    pub fn send_reliable(
        &self,
        addr: SocketAddr,
        segment: PooledSegment,
        listener: Option<Arc<dyn PacketListener>>,
    ) -> Result<u32, ServerError> {
        let remote = self.connected_client(addr, &segment)?;
        let uid = remote
            .connection()
            .manager()
            .enqueue_segment_reliable(segment, listener);
        self.inner.worker.wake();
        Ok(uid)
    }

    /// Queue a segment for best-effort delivery to one client.
    pub fn send_unreliable(&self, addr: SocketAddr, segment: PooledSegment) -> Result<u32, ServerError> {
        let remote = self.connected_client(addr, &segment)?;
        let uid = remote.connection().manager().enqueue_segment_unreliable(segment);
        self.inner.worker.wake();
        Ok(uid)
    }

    fn broadcast_targets(
        &self,
        segment_type: SegmentType,
        exclude: Option<SocketAddr>,
    ) -> Result<ClientList, ServerError> {
        if segment_type.is_reserved() {
            return Err(ServerError::ReservedType(segment_type));
        }
        let mut targets = self.inner.snapshot();
        targets.retain(|remote| Some(remote.endpoint()) != exclude && remote.state().is_connected());
        Ok(targets)
    }

    fn broadcast<F, E>(
        &self,
        segment_type: SegmentType,
        exclude: Option<SocketAddr>,
        mut build: F,
        mut enqueue: E,
    ) -> Result<usize, ServerError>
    where
        F: FnMut(&mut BinaryEncoder<'_>),
        E: FnMut(&RemoteClient, PooledSegment),
    {
        let mut queued = 0;
        for remote in self.broadcast_targets(segment_type, exclude)? {
            let Some(mut segment) = remote.connection().manager().request_segment(segment_type) else {
                warn!(client = %remote.endpoint(), "segment pool exhausted, broadcast skipped");
                continue;
            };
            build(&mut BinaryEncoder::new(&mut segment));
            enqueue(&remote, segment);
            queued += 1;
        }
        if queued > 0 {
            self.inner.worker.wake();
        }
        Ok(queued)
    }

    /// Queue the same reliable message for every connected client except
    /// `exclude`.
    ///
    /// `build` writes the payload once per client, into a segment from that
    /// client's pool. Returns the number of clients it was queued for.
    pub fn send_reliable_broadcast<F>(
        &self,
        segment_type: SegmentType,
        exclude: Option<SocketAddr>,
        listener: Option<Arc<dyn PacketListener>>,
        build: F,
    ) -> Result<usize, ServerError>
    where
        F: FnMut(&mut BinaryEncoder<'_>),
    {
        self.broadcast(segment_type, exclude, build, |remote, segment| {
            remote
                .connection()
                .manager()
                .enqueue_segment_reliable(segment, listener.clone());
        })
    }

    /// Queue the same best-effort message for every connected client except
    /// `exclude`.
    pub fn send_unreliable_broadcast<F>(
        &self,
        segment_type: SegmentType,
        exclude: Option<SocketAddr>,
        build: F,
    ) -> Result<usize, ServerError>
    where
        F: FnMut(&mut BinaryEncoder<'_>),
    {
        self.broadcast(segment_type, exclude, build, |remote, segment| {
            remote.connection().manager().enqueue_segment_unreliable(segment);
        })
    }

    /// Disconnect one client. Returns `false` if it was already closing.
    pub fn disconnect_client(&self, addr: SocketAddr) -> Result<bool, ServerError> {
        let remote = self.client(addr).ok_or(ServerError::UnknownClient(addr))?;
        Ok(self.inner.drop_client(&remote, DisconnectReason::Local, true))
    }

    /// Advance every client's resend timers by `delta`.
    ///
    /// Clients whose reliable segments run out of retransmissions are
    /// disconnected with [`DisconnectReason::MaxRetries`].
    pub fn tick(&self, delta: Duration) -> TickReport {
        let mut total = TickReport::default();
        for remote in self.inner.snapshot() {
            let report = remote.connection().manager().tick(delta);
            total.resent += report.resent;
            total.max_tries_reached += report.max_tries_reached;
            total.bundles_lost += report.bundles_lost;
            if report.max_tries_reached > 0 {
                warn!(client = %remote.endpoint(), "dropping client after max retries");
                self.inner
                    .drop_client(&remote, DisconnectReason::MaxRetries, true);
            }
        }
        if total.resent > 0 {
            self.inner.worker.wake();
        }
        total
    }

    /// Next pending event, without waiting.
    pub fn poll_event(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the server has been released and every
    /// buffered event has been read.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Disconnect every client, stop both socket tasks and close the socket.
    ///
    /// Safe to call more than once.
    pub async fn release(&self) {
        self.inner.drop_all(DisconnectReason::Local, true);
        self.inner.worker.stop();
        self.inner.worker.join().await;
        self.inner.socket.close();
        self.inner.clients.write().clear();
        self.inner.events.lock().take();
    }
}

impl<S: DatagramSocket> Drop for Server<S> {
    fn drop(&mut self) {
        self.inner.worker.stop();
    }
}
