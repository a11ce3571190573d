//! Searching side of LAN discovery.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use super::{DiscoveredServer, DiscoveryError, DiscoveryEvent, read_reply, write_request};
use crate::connection::Worker;
use crate::core::TransportContext;
use crate::core::constants::{
    DEFAULT_DISCOVERY_PORT, DEFAULT_SEARCH_INTERVAL, DEFAULT_SERVER_TIMEOUT, DISCOVERY_POOL_SIZE,
};
use crate::segment::{SegmentPool, SegmentType};
use crate::transport::{DatagramSocket, NetworkStatistics, PacketTransceiver, UdpDatagramSocket};

/// Discovery searcher configuration.
#[derive(Debug, Clone)]
pub struct DiscoverySearcherConfig {
    /// Local address; port 0 picks one.
    pub bind_addr: SocketAddr,

    /// Where searches are sent.
    pub broadcast_addr: SocketAddr,

    /// Game name hosts must match.
    pub game_name: String,

    /// Time between searches.
    pub search_interval: Duration,

    /// Servers silent for this long are dropped from the list.
    pub server_timeout: Duration,
}

impl DiscoverySearcherConfig {
    /// Search for hosts of `game_name` on the default discovery port.
    pub fn new(game_name: impl Into<String>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], DEFAULT_DISCOVERY_PORT)),
            game_name: game_name.into(),
            search_interval: DEFAULT_SEARCH_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
        }
    }

    /// Set the local address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the search target.
    pub fn with_broadcast_addr(mut self, addr: SocketAddr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    /// Set the time between searches.
    pub fn with_search_interval(mut self, interval: Duration) -> Self {
        self.search_interval = interval;
        self
    }

    /// Set the silence after which a server is lost.
    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), DiscoveryError> {
        if self.game_name.is_empty() {
            return Err(DiscoveryError::InvalidConfig("game_name must not be empty".into()));
        }
        if self.search_interval.is_zero() {
            return Err(DiscoveryError::InvalidConfig(
                "search_interval must be non-zero".into(),
            ));
        }
        if self.server_timeout < self.search_interval {
            return Err(DiscoveryError::InvalidConfig(
                "server_timeout must be at least search_interval".into(),
            ));
        }
        Ok(())
    }
}

struct SearcherInner<S> {
    config: DiscoverySearcherConfig,
    context: TransportContext,
    socket: Arc<S>,
    servers: Mutex<HashMap<u64, DiscoveredServer>>,
    worker: Worker,
    events: Mutex<Option<mpsc::UnboundedSender<DiscoveryEvent>>>,
}

impl<S: DatagramSocket> SearcherInner<S> {
    fn emit(&self, event: DiscoveryEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    fn record(&self, server: DiscoveredServer) {
        let known = self
            .servers
            .lock()
            .insert(server.server_uid, server.clone())
            .is_some();
        if known {
            trace!(server = %server.server_name, address = %server.address, "server refreshed");
            self.emit(DiscoveryEvent::ServerUpdated(server));
        } else {
            info!(server = %server.server_name, address = %server.address, "server found");
            self.emit(DiscoveryEvent::ServerFound(server));
        }
    }

    fn expire(&self, now: Duration) {
        let mut lost = Vec::new();
        self.servers.lock().retain(|_, server| {
            let alive = now.saturating_sub(server.last_seen) < self.config.server_timeout;
            if !alive {
                lost.push(server.clone());
            }
            alive
        });
        for server in lost {
            info!(server = %server.server_name, address = %server.address, "server lost");
            self.emit(DiscoveryEvent::ServerLost(server));
        }
    }
}

async fn receive_loop<S: DatagramSocket>(inner: Arc<SearcherInner<S>>) {
    let mut transceiver = PacketTransceiver::new(inner.socket.clone());
    transceiver.set_ignore_salt_mismatch(true);
    let mut shutdown = inner.worker.shutdown();
    let pool = SegmentPool::new(DISCOVERY_POOL_SIZE);
    let statistics = NetworkStatistics::new();
    let mut segments = Vec::new();
    let mut acks = Vec::new();

    while inner.worker.is_running() {
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = transceiver.receive_begin() => result,
        };
        let host = match result {
            Ok(addr) => addr,
            Err(e) if e.is_fatal() => {
                if inner.worker.is_running() {
                    error!(error = %e, "discovery searcher receive failed");
                    inner.worker.stop();
                }
                break;
            }
            Err(e) => {
                debug!(error = %e, "discovery receive error");
                continue;
            }
        };

        segments.clear();
        acks.clear();
        let now = inner.context.now();
        if let Err(e) = transceiver.receive_end(&pool, &mut segments, &mut acks, &statistics, now) {
            debug!(%host, error = %e, "dropped discovery datagram");
            continue;
        }
        let [segment] = segments.as_slice() else {
            continue;
        };
        if segment.segment_type() != SegmentType::NETWORK_DISCOVERY {
            continue;
        }
        let server = match read_reply(segment) {
            Ok(reply) if reply.game_name == inner.config.game_name => DiscoveredServer {
                address: SocketAddr::new(host.ip(), reply.game_port),
                server_name: reply.server_name.to_owned(),
                server_uid: reply.server_uid,
                game_port: reply.game_port,
                extra: reply.extra.to_vec(),
                last_seen: now,
            },
            Ok(reply) => {
                trace!(%host, game = reply.game_name, "reply for another game");
                continue;
            }
            Err(e) => {
                debug!(%host, error = %e, "malformed discovery reply");
                continue;
            }
        };
        segments.clear();
        inner.record(server);
    }
    debug!("discovery searcher receiver stopped");
}

async fn search_loop<S: DatagramSocket>(inner: Arc<SearcherInner<S>>) {
    let mut transceiver = PacketTransceiver::new(inner.socket.clone());
    let mut shutdown = inner.worker.shutdown();
    let pool = SegmentPool::new(DISCOVERY_POOL_SIZE);
    let statistics = NetworkStatistics::new();
    let mut interval = tokio::time::interval(inner.config.search_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while inner.worker.is_running() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = inner.worker.woken() => {}
            _ = interval.tick() => {}
        }
        if !inner.worker.is_running() {
            break;
        }

        let now = inner.context.now();
        inner.expire(now);

        let Some(mut request) = pool.request_free_segment() else {
            error!("discovery pool exhausted");
            continue;
        };
        write_request(&mut request, &inner.config.game_name);
        let mut queue = VecDeque::from([request]);
        let target = inner.config.broadcast_addr;
        match transceiver.transmit(&mut queue, target, &statistics, now).await {
            Ok(_) => trace!(%target, "search sent"),
            Err(e) if e.is_fatal() => {
                error!(%target, error = %e, "search failed");
                inner.worker.stop();
                break;
            }
            Err(e) => debug!(%target, error = %e, "search failed"),
        }
    }
    debug!("discovery searcher stopped");
}

/// Periodically searches the LAN for hosts of one game.
///
/// # Example
///
/// ```ignore
/// use tether_net::discovery::{DiscoveryEvent, DiscoverySearcher, DiscoverySearcherConfig};
///
/// let mut searcher = DiscoverySearcher::bind(DiscoverySearcherConfig::new("crazy-canvas")).await?;
/// while let Some(event) = searcher.next_event().await {
///     if let DiscoveryEvent::ServerFound(server) = event {
///         println!("{} at {}", server.server_name, server.address);
///     }
/// }
/// ```
pub struct DiscoverySearcher<S: DatagramSocket = UdpDatagramSocket> {
    inner: Arc<SearcherInner<S>>,
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

impl DiscoverySearcher<UdpDatagramSocket> {
    /// Bind a broadcast-enabled UDP socket and start searching.
    pub async fn bind(config: DiscoverySearcherConfig) -> Result<Self, DiscoveryError> {
        config.validate()?;
        let socket = UdpDatagramSocket::bind(config.bind_addr).await?;
        Self::with_socket(config, TransportContext::new(), socket)
    }
}

impl<S: DatagramSocket> DiscoverySearcher<S> {
    /// Start searching on an already bound socket.
    ///
    /// Enables broadcast on the socket. Must be called inside a tokio runtime.
    pub fn with_socket(
        config: DiscoverySearcherConfig,
        context: TransportContext,
        socket: S,
    ) -> Result<Self, DiscoveryError> {
        config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;
        socket.set_broadcast(true)?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let inner = Arc::new(SearcherInner {
            config,
            context,
            socket: Arc::new(socket),
            servers: Mutex::new(HashMap::new()),
            worker: Worker::new(),
            events: Mutex::new(Some(events_tx)),
        });
        info!(
            game = %inner.config.game_name,
            target = %inner.config.broadcast_addr,
            "discovery searcher started"
        );
        inner.worker.spawn(receive_loop(inner.clone()));
        inner.worker.spawn(search_loop(inner.clone()));
        Ok(Self { inner, events })
    }

    /// Known servers, by name.
    pub fn servers(&self) -> Vec<DiscoveredServer> {
        let mut servers: Vec<_> = self.inner.servers.lock().values().cloned().collect();
        servers.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        servers
    }

    /// Send a search now instead of waiting for the next interval.
    pub fn search_now(&self) {
        self.inner.worker.wake();
    }

    /// The local socket address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Check if the searcher is still running.
    pub fn is_running(&self) -> bool {
        self.inner.worker.is_running()
    }

    /// Next pending event, without waiting.
    pub fn poll_event(&mut self) -> Option<DiscoveryEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next event. Returns `None` after release.
    pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        self.events.recv().await
    }

    /// Stop searching and close the socket. Safe to call more than once.
    pub async fn release(&self) {
        self.inner.worker.stop();
        self.inner.worker.join().await;
        self.inner.socket.close();
        self.inner.servers.lock().clear();
        self.inner.events.lock().take();
    }
}

impl<S: DatagramSocket> Drop for DiscoverySearcher<S> {
    fn drop(&mut self) {
        self.inner.worker.stop();
    }
}
