//! Answering side of LAN discovery.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use super::{DiscoveryError, read_request};
use crate::connection::Worker;
use crate::core::TransportContext;
use crate::core::constants::{DEFAULT_DISCOVERY_PORT, DISCOVERY_POOL_SIZE, MAX_SEGMENT_SIZE};
use crate::segment::{BinaryEncoder, SegmentPool, SegmentType};
use crate::transport::{DatagramSocket, NetworkStatistics, PacketTransceiver, UdpDatagramSocket};

/// Discovery host configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryHostConfig {
    /// Address to listen for searches on.
    pub bind_addr: SocketAddr,

    /// Game name searches must match.
    pub game_name: String,

    /// Name shown in server browsers.
    pub server_name: String,

    /// Port of the game server being announced.
    pub game_port: u16,
}

impl DiscoveryHostConfig {
    /// Announce the game server on `game_port` for `game_name`.
    pub fn new(game_name: impl Into<String>, game_port: u16) -> Self {
        let game_name = game_name.into();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DISCOVERY_PORT)),
            server_name: game_name.clone(),
            game_name,
            game_port,
        }
    }

    /// Set the listen address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the server name.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Payload bytes taken by the fixed reply fields.
    fn reply_len(&self) -> usize {
        2 + self.game_name.len() + 2 + 2 + self.server_name.len() + 8
    }

    /// Check that the names are usable and the fixed reply fits a segment.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.game_name.is_empty() {
            return Err(DiscoveryError::InvalidConfig("game_name must not be empty".into()));
        }
        if self.reply_len() > MAX_SEGMENT_SIZE {
            return Err(DiscoveryError::InvalidConfig(format!(
                "game_name and server_name need {} reply bytes, at most {MAX_SEGMENT_SIZE} fit",
                self.reply_len()
            )));
        }
        Ok(())
    }
}

type ReplyHook = Arc<dyn Fn(&mut BinaryEncoder<'_>) + Send + Sync>;

struct HostInner<S> {
    config: DiscoveryHostConfig,
    context: TransportContext,
    socket: Arc<S>,
    server_uid: u64,
    hook: RwLock<Option<ReplyHook>>,
    worker: Worker,
}

impl<S: DatagramSocket> HostInner<S> {
    async fn answer(
        &self,
        transceiver: &mut PacketTransceiver<S>,
        pool: &SegmentPool,
        statistics: &NetworkStatistics,
        target: SocketAddr,
    ) {
        let Some(mut reply) = pool.request_free_segment() else {
            error!("discovery pool exhausted");
            return;
        };
        reply.set_type(SegmentType::NETWORK_DISCOVERY);
        {
            let mut encoder = BinaryEncoder::checked(&mut reply);
            encoder
                .write_string(&self.config.game_name)
                .write_u16(self.config.game_port)
                .write_string(&self.config.server_name)
                .write_u64(self.server_uid);
            let hook = self.hook.read().clone();
            if let Some(hook) = hook {
                hook(&mut encoder);
            }
            if encoder.overflowed() {
                warn!(searcher = %target, "discovery reply exceeds one segment, not sent");
                return;
            }
        }

        let mut queue = VecDeque::from([reply]);
        let now = self.context.now();
        match transceiver.transmit(&mut queue, target, statistics, now).await {
            Ok(_) => trace!(searcher = %target, "discovery reply sent"),
            Err(e) => debug!(searcher = %target, error = %e, "discovery reply failed"),
        }
    }
}

async fn receive_loop<S: DatagramSocket>(inner: Arc<HostInner<S>>) {
    let mut receiver = PacketTransceiver::new(inner.socket.clone());
    let mut sender = PacketTransceiver::new(inner.socket.clone());
    receiver.set_ignore_salt_mismatch(true);
    let mut shutdown = inner.worker.shutdown();
    let pool = SegmentPool::new(DISCOVERY_POOL_SIZE);
    let statistics = NetworkStatistics::new();
    let mut segments = Vec::new();
    let mut acks = Vec::new();

    while inner.worker.is_running() {
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = receiver.receive_begin() => result,
        };
        let searcher = match result {
            Ok(addr) => addr,
            Err(e) if e.is_fatal() => {
                if inner.worker.is_running() {
                    error!(error = %e, "discovery host receive failed");
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
        if let Err(e) = receiver.receive_end(&pool, &mut segments, &mut acks, &statistics, now) {
            debug!(%searcher, error = %e, "dropped discovery datagram");
            continue;
        }
        let wanted = match segments.as_slice() {
            [segment] => read_request(segment) == Some(inner.config.game_name.as_str()),
            _ => false,
        };
        segments.clear();
        if wanted {
            inner.answer(&mut sender, &pool, &statistics, searcher).await;
        }
    }
    debug!("discovery host stopped");
}

/// Answers discovery searches for one game server.
///
/// # Example
///
/// ```ignore
/// use tether_net::discovery::{DiscoveryHost, DiscoveryHostConfig};
///
/// let host = DiscoveryHost::bind(
///     DiscoveryHostConfig::new("crazy-canvas", 4451).with_server_name("Den"),
/// )
/// .await?;
/// host.set_reply_hook(move |encoder| {
///     encoder.write_u8(player_count).write_string("docks");
/// });
/// ```
pub struct DiscoveryHost<S: DatagramSocket = UdpDatagramSocket> {
    inner: Arc<HostInner<S>>,
}

impl DiscoveryHost<UdpDatagramSocket> {
    /// Bind a UDP socket and start answering searches.
    pub async fn bind(config: DiscoveryHostConfig) -> Result<Self, DiscoveryError> {
        let socket = UdpDatagramSocket::bind(config.bind_addr).await?;
        Self::with_socket(config, TransportContext::new(), socket)
    }
}

impl<S: DatagramSocket> DiscoveryHost<S> {
    /// Start answering searches on an already bound socket.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_socket(
        config: DiscoveryHostConfig,
        context: TransportContext,
        socket: S,
    ) -> Result<Self, DiscoveryError> {
        config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;

        let inner = Arc::new(HostInner {
            config,
            context,
            socket: Arc::new(socket),
            server_uid: rand::thread_rng().gen_range(1..=u64::MAX),
            hook: RwLock::new(None),
            worker: Worker::new(),
        });
        if let Ok(addr) = inner.socket.local_addr() {
            info!(
                %addr,
                game = %inner.config.game_name,
                server = %inner.config.server_name,
                "discovery host started"
            );
        }
        inner.worker.spawn(receive_loop(inner.clone()));
        Ok(Self { inner })
    }

    /// Set the function that appends extra fields to every reply.
    ///
    /// It runs on the receiver task, once per answered search. A reply
    /// that no longer fits one segment is dropped with a warning.
    pub fn set_reply_hook<F>(&self, hook: F)
    where
        F: Fn(&mut BinaryEncoder<'_>) + Send + Sync + 'static,
    {
        *self.inner.hook.write() = Some(Arc::new(hook));
    }

    /// Random identifier sent with every reply.
    pub fn server_uid(&self) -> u64 {
        self.inner.server_uid
    }

    /// The host's configuration.
    pub fn config(&self) -> &DiscoveryHostConfig {
        &self.inner.config
    }

    /// The local socket address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Check if the host is still answering.
    pub fn is_running(&self) -> bool {
        self.inner.worker.is_running()
    }

    /// Stop answering and close the socket. Safe to call more than once.
    pub async fn release(&self) {
        if self.inner.worker.stop() {
            info!(game = %self.inner.config.game_name, "discovery host stopped");
        }
        self.inner.worker.join().await;
        self.inner.socket.close();
    }
}

impl<S: DatagramSocket> Drop for DiscoveryHost<S> {
    fn drop(&mut self) {
        self.inner.worker.stop();
    }
}

impl<S: DatagramSocket> fmt::Debug for DiscoveryHost<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryHost")
            .field("config", &self.inner.config)
            .field("server_uid", &self.inner.server_uid)
            .finish_non_exhaustive()
    }
}
