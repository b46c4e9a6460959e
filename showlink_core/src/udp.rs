//! Message-oriented UDP socket with a simulated "connect".
//!
//! UDP has no connection. `connect` binds the local socket and starts the
//! receive loop; the optional remote only filters senders and is the target
//! of `send` and keep-alives.

use crate::address::{self, IpFamily};
use crate::error::{Result, TransportError};
use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest payload of a single IPv4 UDP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub enum UdpEvent {
    Open(SocketAddr),
    Message { from: SocketAddr, data: Bytes },
    Error { code: i32, message: String },
    /// The socket failed and was released.
    Close,
}

#[derive(Debug, Clone)]
pub struct UdpConnectionConfig {
    pub port: u16,
    pub local_ip: Option<IpAddr>,
    pub broadcast: bool,
    /// Advisory keep-alive towards the validated remote.
    pub keep_alive: Option<Duration>,
    /// SO_RCVBUF/SO_SNDBUF to request before querying the effective size.
    pub requested_buffer_size: Option<usize>,
    pub event_capacity: usize,
}

impl Default for UdpConnectionConfig {
    fn default() -> Self {
        Self {
            port: 0,
            local_ip: None,
            broadcast: true,
            keep_alive: None,
            requested_buffer_size: Some(256 * 1024),
            event_capacity: 1024,
        }
    }
}

#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    config: UdpConnectionConfig,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    remote: Mutex<Option<SocketAddr>>,
    events: Mutex<Option<mpsc::Sender<UdpEvent>>>,
    cancel: Mutex<Option<CancellationToken>>,
    local_addr: Mutex<Option<SocketAddr>>,
    io_buffer_size: AtomicUsize,
    disposed: AtomicBool,
}

fn bind_udp(addr: SocketAddr, config: &UdpConnectionConfig) -> std::io::Result<(UdpSocket, usize)> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if config.broadcast && addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    if let Some(size) = config.requested_buffer_size {
        // The OS may clamp these; the effective value is read back below.
        let _ = socket.set_recv_buffer_size(size);
        let _ = socket.set_send_buffer_size(size);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let recv = socket.recv_buffer_size()?;
    let send = socket.send_buffer_size()?;
    let io_size = recv.min(send).min(MAX_DATAGRAM_SIZE);

    let std_socket: std::net::UdpSocket = socket.into();
    Ok((UdpSocket::from_std(std_socket)?, io_size))
}

impl UdpConnection {
    pub fn new(config: UdpConnectionConfig) -> (Self, mpsc::Receiver<UdpEvent>) {
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let inner = Arc::new(UdpInner {
            config,
            socket: Mutex::new(None),
            remote: Mutex::new(None),
            events: Mutex::new(Some(tx)),
            cancel: Mutex::new(None),
            local_addr: Mutex::new(None),
            io_buffer_size: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        });
        (Self { inner }, rx)
    }

    /// Bind the socket and start receiving. Datagrams from hosts other than
    /// `remote`'s IP are dropped when a remote is given.
    pub async fn connect(&self, remote: Option<SocketAddr>) -> Result<SocketAddr> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if let Some(addr) = self.local_addr() {
            *self.inner.remote.lock() = remote;
            return Ok(addr);
        }

        let config = &self.inner.config;
        let family = remote
            .map(|r| IpFamily::of(&r.ip()))
            .unwrap_or(IpFamily::V4);
        let bind_ip = config.local_ip.unwrap_or(family.any());
        let (socket, io_size) = bind_udp(SocketAddr::new(bind_ip, config.port), config)?;
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);

        self.inner.io_buffer_size.store(io_size, Ordering::SeqCst);
        *self.inner.socket.lock() = Some(Arc::clone(&socket));
        *self.inner.remote.lock() = remote;
        *self.inner.local_addr.lock() = Some(local);

        let token = CancellationToken::new();
        *self.inner.cancel.lock() = Some(token.clone());
        tokio::spawn(Arc::clone(&self.inner).receive_loop(socket, token.clone()));
        if let (Some(period), Some(_)) = (config.keep_alive, remote) {
            tokio::spawn(Arc::clone(&self.inner).keep_alive_loop(period, token));
        }

        info!("UDP socket bound on {} (io buffer {} bytes)", local, io_size);
        self.inner.emit(UdpEvent::Open(local)).await;
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.inner.remote.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.socket.lock().is_some()
    }

    /// Largest datagram the socket buffers can carry, known after `connect`.
    pub fn io_buffer_size(&self) -> usize {
        self.inner.io_buffer_size.load(Ordering::SeqCst)
    }

    pub fn ipv4_broadcast_address(&self) -> Ipv4Addr {
        address::ipv4_broadcast_address()
    }

    pub async fn send_to(&self, ip: IpAddr, data: &[u8], port: u16) -> Result<usize> {
        self.send_to_addr(SocketAddr::new(ip, port), data).await
    }

    pub async fn send_to_addr(&self, target: SocketAddr, data: &[u8]) -> Result<usize> {
        let socket = self
            .inner
            .socket
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        match socket.send_to(data, target).await {
            Ok(n) => Ok(n),
            Err(e) => {
                let err = TransportError::Io(e);
                debug!("UDP send to {} failed: {}", target, err);
                self.inner
                    .emit(UdpEvent::Error {
                        code: err.code(),
                        message: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    /// Send to the remote given at `connect`.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        let remote = self.remote_addr().ok_or(TransportError::NotConnected)?;
        self.send_to_addr(remote, data).await
    }

    /// Send to the limited broadcast address (255.255.255.255).
    pub async fn broadcast(&self, data: &[u8], port: u16) -> Result<usize> {
        self.send_to(IpAddr::V4(address::LIMITED_BROADCAST), data, port)
            .await
    }

    /// Release the socket without raising `Close`.
    pub async fn disconnect(&self) {
        self.inner.release();
    }

    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.events.lock().take();
        self.inner.release();
    }
}

impl UdpInner {
    async fn emit(&self, event: UdpEvent) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    fn release(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        self.socket.lock().take();
        self.local_addr.lock().take();
    }

    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>, token: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => return,
                r = socket.recv_from(&mut buf) => r,
            };

            match received {
                Ok((len, from)) => {
                    let expected = *self.remote.lock();
                    if let Some(remote) = expected {
                        if remote.ip() != from.ip() {
                            debug!("Dropping datagram from unexpected sender {}", from);
                            continue;
                        }
                    }
                    // Empty datagrams are keep-alives.
                    if len == 0 {
                        continue;
                    }
                    self.emit(UdpEvent::Message {
                        from,
                        data: Bytes::copy_from_slice(&buf[..len]),
                    })
                    .await;
                }
                // ICMP unreachable replies surface here on some platforms.
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused
                    ) =>
                {
                    debug!("Ignoring UDP receive error: {}", e);
                }
                Err(e) => {
                    let err = TransportError::Io(e);
                    warn!("UDP receive failed: {}", err);
                    self.emit(UdpEvent::Error {
                        code: err.code(),
                        message: err.to_string(),
                    })
                    .await;
                    if token.is_cancelled() {
                        return;
                    }
                    self.release();
                    self.emit(UdpEvent::Close).await;
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    return;
                }
            }
        }
    }

    async fn keep_alive_loop(self: Arc<Self>, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let socket = self.socket.lock().clone();
            let remote = *self.remote.lock();
            if let (Some(socket), Some(remote)) = (socket, remote) {
                let _ = socket.send_to(&[], remote).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::Receiver<UdpEvent>) -> UdpEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timeout waiting for UDP event")
            .expect("UDP channel closed")
    }

    fn loopback() -> UdpConnectionConfig {
        UdpConnectionConfig {
            local_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, mut a_rx) = UdpConnection::new(loopback());
        let (b, mut b_rx) = UdpConnection::new(loopback());
        let a_addr = a.connect(None).await.unwrap();
        let b_addr = b.connect(None).await.unwrap();
        assert_eq!(next_event(&mut a_rx).await, UdpEvent::Open(a_addr));
        assert_eq!(next_event(&mut b_rx).await, UdpEvent::Open(b_addr));

        a.send_to(b_addr.ip(), b"ping", b_addr.port()).await.unwrap();
        assert_eq!(
            next_event(&mut b_rx).await,
            UdpEvent::Message {
                from: a_addr,
                data: Bytes::from_static(b"ping")
            }
        );
        assert!(a.io_buffer_size() > 0);
        assert!(a.io_buffer_size() <= MAX_DATAGRAM_SIZE);

        a.dispose().await;
        b.dispose().await;
    }

    #[tokio::test]
    async fn test_remote_filter_and_keep_alive_swallowed() {
        let (server, mut server_rx) = UdpConnection::new(loopback());
        let server_addr = server.connect(None).await.unwrap();
        let _ = next_event(&mut server_rx).await;

        // Filter on an address that never sends.
        let (filtered, mut filtered_rx) = UdpConnection::new(loopback());
        let filtered_addr = filtered
            .connect(Some("127.0.0.2:9".parse().unwrap()))
            .await
            .unwrap();
        let _ = next_event(&mut filtered_rx).await;

        server
            .send_to(filtered_addr.ip(), b"blocked", filtered_addr.port())
            .await
            .unwrap();
        assert!(
            timeout(Duration::from_millis(200), filtered_rx.recv())
                .await
                .is_err()
        );

        let (client, mut client_rx) = UdpConnection::new(loopback());
        client.connect(Some(server_addr)).await.unwrap();
        let _ = next_event(&mut client_rx).await;
        client.send(&[]).await.unwrap();
        client.send(b"data").await.unwrap();
        match next_event(&mut server_rx).await {
            UdpEvent::Message { data, .. } => assert_eq!(&data[..], b"data"),
            other => panic!("Expected Message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_without_socket_fails() {
        let (conn, _rx) = UdpConnection::new(loopback());
        assert!(matches!(
            conn.send(b"x").await,
            Err(TransportError::NotConnected)
        ));
        conn.connect(None).await.unwrap();
        conn.disconnect().await;
        assert!(!conn.is_connected());
    }
}
