//! Datagram socket seam and its tokio UDP implementation.
//!
//! The transport only ever talks to a [`DatagramSocket`], so tests can swap
//! in the in-memory network from [`super::memory`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Error returned by sockets after [`DatagramSocket::close`].
pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed")
}

/// A raw, connectionless datagram socket.
///
/// Implementations are shared between a receiver task and a transmitter
/// task, so every method takes `&self`.
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send one datagram to `target`, returning the bytes sent.
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Wait for one datagram, returning its length and sender.
    ///
    /// Pending and future calls fail once the socket is closed.
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    /// Allow or forbid sending to broadcast addresses.
    fn set_broadcast(&self, enabled: bool) -> io::Result<()>;

    /// Address the socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Close the socket, unblocking any pending receive.
    fn close(&self);
}

/// Tokio UDP socket with cooperative close.
#[derive(Debug)]
pub struct UdpDatagramSocket {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,
    /// Flips to `true` on close.
    closed: watch::Sender<bool>,
}

impl UdpDatagramSocket {
    /// Bind a socket to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        UdpDatagramSocketBuilder::new().bind(addr).await
    }

    /// Wrap an existing UDP socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket: Arc::new(socket),
            closed,
        }
    }

    /// Get a reference to the underlying socket.
    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl DatagramSocket for UdpDatagramSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.socket.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(closed_error());
        }
        tokio::select! {
            result = self.socket.recv_from(buf) => result,
            _ = closed.changed() => Err(closed_error()),
        }
    }

    fn set_broadcast(&self, enabled: bool) -> io::Result<()> {
        self.socket.set_broadcast(enabled)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Builder for creating UDP sockets with custom options.
#[derive(Debug, Clone, Default)]
pub struct UdpDatagramSocketBuilder {
    broadcast: bool,
    ttl: Option<u32>,
}

impl UdpDatagramSocketBuilder {
    /// Create a new socket builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable sending to broadcast addresses.
    pub fn broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    /// Set the IP time-to-live.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Bind to the given address and create a socket.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<UdpDatagramSocket> {
        let socket = UdpSocket::bind(addr).await?;
        self.from_socket(socket)
    }

    /// Create a socket from an existing UDP socket.
    pub fn from_socket(self, socket: UdpSocket) -> io::Result<UdpDatagramSocket> {
        if self.broadcast {
            socket.set_broadcast(true)?;
        }
        if let Some(ttl) = self.ttl {
            socket.set_ttl(ttl)?;
        }
        Ok(UdpDatagramSocket::from_socket(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_bind() {
        let socket = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() != 0);
    }

    #[tokio::test]
    async fn test_socket_send_recv() {
        let server = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let data = b"hello tether";
        client.send_to(data, server_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], data);
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let socket = Arc::new(
            UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let receiver = {
            let socket = socket.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                socket.recv_from(&mut buf).await
            })
        };

        tokio::task::yield_now().await;
        socket.close();
        let result = receiver.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);

        let mut buf = [0u8; 16];
        assert!(socket.recv_from(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_socket_builder() {
        let socket = UdpDatagramSocketBuilder::new()
            .broadcast(true)
            .ttl(16)
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        assert!(socket.inner().broadcast().unwrap());
        assert_eq!(socket.inner().ttl().unwrap(), 16);
    }
}
