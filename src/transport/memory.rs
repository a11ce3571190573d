//! In-process datagram network with fault injection.
//!
//! Real networks drop, reorder and duplicate packets. [`MemoryNetwork`]
//! routes datagrams between [`MemorySocket`]s in the same process and
//! applies a seeded fault model, so reliability tests are reproducible:
//!
//! | Fault        | Effect                                               |
//! |--------------|------------------------------------------------------|
//! | Loss         | Drop a datagram with probability `loss_rate`.        |
//! | Duplication  | Deliver a datagram twice.                            |
//! | Reordering   | Insert a datagram at a random position of the queue. |

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;

use super::socket::{DatagramSocket, closed_error};

/// Fault model applied to every datagram.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkConditions {
    /// Probability that a datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a datagram overtakes queued ones.
    pub reorder_rate: f64,
}

impl LinkConditions {
    /// A perfect link.
    pub fn perfect() -> Self {
        Self::default()
    }

    /// Set the loss probability.
    pub fn with_loss(mut self, rate: f64) -> Self {
        self.loss_rate = rate;
        self
    }

    /// Set the duplication probability.
    pub fn with_duplication(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate;
        self
    }

    /// Set the reordering probability.
    pub fn with_reordering(mut self, rate: f64) -> Self {
        self.reorder_rate = rate;
        self
    }
}

struct Datagram {
    payload: Vec<u8>,
    from: SocketAddr,
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<Datagram>,
    closed: bool,
}

#[derive(Default)]
struct Endpoint {
    inbox: Mutex<Inbox>,
    ready: Notify,
    broadcast: AtomicBool,
}

impl Endpoint {
    fn deliver(&self, datagram: Datagram, position: Option<f64>) {
        let mut inbox = self.inbox.lock();
        if inbox.closed {
            return;
        }
        match position {
            Some(at) if !inbox.queue.is_empty() => {
                let index = ((inbox.queue.len() as f64) * at) as usize;
                inbox.queue.insert(index, datagram);
            }
            _ => inbox.queue.push_back(datagram),
        }
        drop(inbox);
        self.ready.notify_one();
    }
}

struct NetworkState {
    endpoints: HashMap<SocketAddr, Arc<Endpoint>>,
    conditions: LinkConditions,
    rng: StdRng,
    next_port: u16,
}

/// A shared, in-process network. Cloning yields another handle to it.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create a perfect network.
    pub fn new() -> Self {
        Self::with_conditions(LinkConditions::perfect(), 0)
    }

    /// Create a network with a fault model and RNG seed.
    pub fn with_conditions(conditions: LinkConditions, seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                endpoints: HashMap::new(),
                conditions,
                rng: StdRng::seed_from_u64(seed),
                next_port: 40000,
            })),
        }
    }

    /// Replace the fault model.
    pub fn set_conditions(&self, conditions: LinkConditions) {
        self.state.lock().conditions = conditions;
    }

    /// Bind a socket. Port 0 picks a free port; an unspecified IP binds
    /// to loopback.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemorySocket> {
        let mut state = self.state.lock();
        let ip = if addr.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            addr.ip()
        };
        let port = if addr.port() == 0 {
            loop {
                let candidate = state.next_port;
                state.next_port = state.next_port.checked_add(1).unwrap_or(40000);
                if !state.endpoints.contains_key(&SocketAddr::new(ip, candidate)) {
                    break candidate;
                }
            }
        } else {
            addr.port()
        };
        let local = SocketAddr::new(ip, port);
        if state.endpoints.contains_key(&local) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{local} already bound"),
            ));
        }

        let endpoint = Arc::new(Endpoint::default());
        state.endpoints.insert(local, endpoint.clone());
        Ok(MemorySocket {
            local,
            endpoint,
            network: self.clone(),
            sent: AtomicUsize::new(0),
        })
    }

    fn route(&self, from: SocketAddr, payload: &[u8], target: SocketAddr, broadcast: bool) {
        let mut state = self.state.lock();
        let targets: Vec<Arc<Endpoint>> = match target.ip() {
            IpAddr::V4(ip) if broadcast && ip.is_broadcast() => state
                .endpoints
                .iter()
                .filter(|(addr, _)| addr.port() == target.port() && **addr != from)
                .map(|(_, endpoint)| endpoint.clone())
                .collect(),
            _ => state.endpoints.get(&target).cloned().into_iter().collect(),
        };

        let conditions = state.conditions;
        for endpoint in targets {
            if state.rng.gen_bool(conditions.loss_rate.clamp(0.0, 1.0)) {
                continue;
            }
            let copies = if state.rng.gen_bool(conditions.duplicate_rate.clamp(0.0, 1.0)) {
                2
            } else {
                1
            };
            for _ in 0..copies {
                let position = state
                    .rng
                    .gen_bool(conditions.reorder_rate.clamp(0.0, 1.0))
                    .then(|| state.rng.gen_range(0.0..1.0));
                endpoint.deliver(
                    Datagram {
                        payload: payload.to_vec(),
                        from,
                    },
                    position,
                );
            }
        }
    }

    fn unbind(&self, addr: SocketAddr) {
        self.state.lock().endpoints.remove(&addr);
    }
}

/// A socket on a [`MemoryNetwork`].
pub struct MemorySocket {
    local: SocketAddr,
    endpoint: Arc<Endpoint>,
    network: MemoryNetwork,
    sent: AtomicUsize,
}

impl MemorySocket {
    /// Datagrams handed to `send_to` so far.
    pub fn sent_datagrams(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    /// Datagrams waiting to be received.
    pub fn pending(&self) -> usize {
        self.endpoint.inbox.lock().queue.len()
    }
}

impl DatagramSocket for MemorySocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.endpoint.inbox.lock().closed {
            return Err(closed_error());
        }
        let broadcast = self.endpoint.broadcast.load(Ordering::Relaxed);
        if let IpAddr::V4(ip) = target.ip() {
            if ip.is_broadcast() && !broadcast {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "broadcast not enabled",
                ));
            }
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.network.route(self.local, buf, target, broadcast);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            {
                let mut inbox = self.endpoint.inbox.lock();
                if inbox.closed {
                    return Err(closed_error());
                }
                if let Some(datagram) = inbox.queue.pop_front() {
                    let len = datagram.payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&datagram.payload[..len]);
                    return Ok((len, datagram.from));
                }
            }
            self.endpoint.ready.notified().await;
        }
    }

    fn set_broadcast(&self, enabled: bool) -> io::Result<()> {
        self.endpoint.broadcast.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn close(&self) {
        {
            let mut inbox = self.endpoint.inbox.lock();
            if inbox.closed {
                return;
            }
            inbox.closed = true;
            inbox.queue.clear();
        }
        self.network.unbind(self.local);
        self.endpoint.ready.notify_one();
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_unicast_delivery() {
        let network = MemoryNetwork::new();
        let a = network.bind(addr("127.0.0.1:0")).unwrap();
        let b = network.bind(addr("127.0.0.1:9000")).unwrap();

        a.send_to(b"ping", b.local_addr().unwrap()).await.unwrap();
        assert_eq!(a.sent_datagrams(), 1);
        assert_eq!(b.pending(), 1);

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bind_conflicts_and_unspecified() {
        let network = MemoryNetwork::new();
        let a = network.bind(addr("0.0.0.0:7000")).unwrap();
        assert_eq!(a.local_addr().unwrap(), addr("127.0.0.1:7000"));

        let err = network.bind(addr("127.0.0.1:7000")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        drop(a);
        assert!(network.bind(addr("127.0.0.1:7000")).is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_requires_permission() {
        let network = MemoryNetwork::new();
        let sender = network.bind(addr("127.0.0.1:0")).unwrap();
        let host_a = network.bind(addr("127.0.0.1:4450")).unwrap();
        let host_b = network.bind(addr("127.0.0.2:4450")).unwrap();
        let other = network.bind(addr("127.0.0.3:4451")).unwrap();

        let target = addr("255.255.255.255:4450");
        let err = sender.send_to(b"who", target).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        sender.set_broadcast(true).unwrap();
        sender.send_to(b"who", target).await.unwrap();
        assert_eq!(host_a.pending(), 1);
        assert_eq!(host_b.pending(), 1);
        assert_eq!(other.pending(), 0);
    }

    #[tokio::test]
    async fn test_total_loss() {
        let network = MemoryNetwork::with_conditions(LinkConditions::perfect().with_loss(1.0), 1);
        let a = network.bind(addr("127.0.0.1:0")).unwrap();
        let b = network.bind(addr("127.0.0.1:0")).unwrap();
        a.send_to(b"gone", b.local_addr().unwrap()).await.unwrap();
        assert_eq!(b.pending(), 0);
    }

    #[tokio::test]
    async fn test_duplication() {
        let network =
            MemoryNetwork::with_conditions(LinkConditions::perfect().with_duplication(1.0), 1);
        let a = network.bind(addr("127.0.0.1:0")).unwrap();
        let b = network.bind(addr("127.0.0.1:0")).unwrap();
        a.send_to(b"twice", b.local_addr().unwrap()).await.unwrap();
        assert_eq!(b.pending(), 2);
    }

    #[tokio::test]
    async fn test_reordering_keeps_every_datagram() {
        let network =
            MemoryNetwork::with_conditions(LinkConditions::perfect().with_reordering(1.0), 5);
        let a = network.bind(addr("127.0.0.1:0")).unwrap();
        let b = network.bind(addr("127.0.0.1:0")).unwrap();
        let target = b.local_addr().unwrap();
        for i in 0u8..20 {
            a.send_to(&[i], target).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut buf = [0u8; 1];
        while b.pending() > 0 {
            b.recv_from(&mut buf).await.unwrap();
            seen.push(buf[0]);
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0u8..20).collect::<Vec<_>>());
        assert_ne!(seen, sorted);
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let network = MemoryNetwork::new();
        let socket = Arc::new(network.bind(addr("127.0.0.1:0")).unwrap());
        let receiver = {
            let socket = socket.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                socket.recv_from(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        socket.close();
        assert!(receiver.await.unwrap().is_err());
    }
}
