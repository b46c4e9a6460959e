//! TCP listener with a bounded connection pool and dual-stack support.

use crate::address::IpFamily;
use crate::error::{Result, TransportError};
use crate::tcp::connection::{
    ConnectionEvent, ConnectionId, ConnectionStatus, TcpConnection, TcpConnectionConfig,
};
use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const LISTEN_BACKLOG: i32 = 1024;

/// Events reported by a server. Per-connection events carry the connection id.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Listening(SocketAddr),
    NewConnection {
        id: ConnectionId,
        remote: Option<SocketAddr>,
    },
    Message {
        id: ConnectionId,
        data: Bytes,
    },
    ConnectionError {
        id: ConnectionId,
        code: i32,
        message: String,
    },
    ConnectionClosed {
        id: ConnectionId,
    },
    Error {
        code: i32,
        message: String,
    },
    Closed,
}

#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub port: u16,
    /// Bind address; `None` listens on every interface of both families.
    pub local_ip: Option<IpAddr>,
    pub max_connections: usize,
    /// Template for accepted connections (framing, keep-alive, watchdog).
    pub connection: TcpConnectionConfig,
    pub dual_stack: bool,
    pub event_capacity: usize,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            local_ip: None,
            max_connections: 64,
            connection: TcpConnectionConfig::default(),
            dual_stack: true,
            event_capacity: 1024,
        }
    }
}

#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: TcpServerConfig,
    connections: Mutex<Vec<TcpConnection>>,
    events: Mutex<Option<mpsc::Sender<ServerEvent>>>,
    cancel: Mutex<Option<CancellationToken>>,
    local_addr: Mutex<Option<SocketAddr>>,
    auxiliary_addr: Mutex<Option<SocketAddr>>,
    disposed: AtomicBool,
}

/// Bind a non-blocking listener. IPv6 sockets are v6-only so that an IPv4
/// listener can share the port.
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

impl TcpServer {
    pub fn new(config: TcpServerConfig) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let inner = Arc::new(ServerInner {
            config,
            connections: Mutex::new(Vec::new()),
            events: Mutex::new(Some(tx)),
            cancel: Mutex::new(None),
            local_addr: Mutex::new(None),
            auxiliary_addr: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        (Self { inner }, rx)
    }

    /// Start listening and return the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let config = &self.inner.config;
        let bind_ip = config.local_ip.unwrap_or(IpFamily::V4.any());
        let listener = bind_listener(SocketAddr::new(bind_ip, config.port))?;
        let addr = listener.local_addr()?;

        let token = CancellationToken::new();
        *self.inner.cancel.lock() = Some(token.clone());
        *self.inner.local_addr.lock() = Some(addr);
        tokio::spawn(Arc::clone(&self.inner).accept_loop(listener, token.clone()));
        info!("TCP server listening on {}", addr);

        if config.local_ip.is_none() && config.dual_stack {
            let secondary = SocketAddr::new(IpFamily::of(&bind_ip).other().any(), addr.port());
            match bind_listener(secondary) {
                Ok(aux) => {
                    let aux_addr = aux.local_addr().unwrap_or(secondary);
                    *self.inner.auxiliary_addr.lock() = Some(aux_addr);
                    tokio::spawn(Arc::clone(&self.inner).accept_loop(aux, token));
                    info!("TCP auxiliary listener on {}", aux_addr);
                }
                Err(e) => warn!("Auxiliary listener on {} unavailable: {}", secondary, e),
            }
        }

        self.inner.emit(ServerEvent::Listening(addr)).await;
        Ok(addr)
    }

    /// Stop listening and close every pooled connection.
    pub async fn stop(&self) {
        let token = self.inner.cancel.lock().take();
        let Some(token) = token else {
            return;
        };
        token.cancel();

        let pool: Vec<TcpConnection> = std::mem::take(&mut *self.inner.connections.lock());
        for conn in pool {
            conn.dispose().await;
        }
        self.inner.local_addr.lock().take();
        self.inner.auxiliary_addr.lock().take();
        info!("TCP server stopped");
        self.inner.emit(ServerEvent::Closed).await;
    }

    /// Detach event delivery and stop. Safe to call repeatedly.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.events.lock().take();
        self.stop().await;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Address of the secondary-family listener, when one is running.
    pub fn auxiliary_addr(&self) -> Option<SocketAddr> {
        *self.inner.auxiliary_addr.lock()
    }

    pub fn is_listening(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Send `data` to every live connection; returns how many accepted it.
    pub async fn distribute(&self, data: &[u8]) -> usize {
        let snapshot = self.inner.snapshot();
        let mut delivered = 0;
        for conn in snapshot {
            if conn.send(data).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn connection(&self, index: usize) -> Option<TcpConnection> {
        self.inner.purge();
        self.inner.connections.lock().get(index).cloned()
    }

    pub fn connection_by_id(&self, id: ConnectionId) -> Option<TcpConnection> {
        self.inner.purge();
        self.inner
            .connections
            .lock()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    pub fn connections_count(&self) -> usize {
        self.inner.purge();
        self.inner.connections.lock().len()
    }

    /// Remove dead connections from the pool.
    pub fn purge_connections(&self) {
        self.inner.purge();
    }

    /// Close one connection and drop it from the pool.
    pub async fn close_connection(&self, conn: &TcpConnection) {
        let id = conn.id();
        self.inner.connections.lock().retain(|c| c.id() != id);
        conn.dispose().await;
    }
}

impl ServerInner {
    async fn emit(&self, event: ServerEvent) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    fn purge(&self) {
        self.connections.lock().retain(|c| {
            !matches!(
                c.status(),
                ConnectionStatus::Disconnected | ConnectionStatus::Error
            )
        });
    }

    fn snapshot(&self) -> Vec<TcpConnection> {
        self.purge();
        self.connections.lock().clone()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => return,
                r = listener.accept() => r,
            };

            match accepted {
                Ok((stream, remote)) => self.admit(stream, remote, &token).await,
                Err(e) => {
                    let err = TransportError::Io(e);
                    warn!("Accept failed: {}", err);
                    self.emit(ServerEvent::Error {
                        code: err.code(),
                        message: err.to_string(),
                    })
                    .await;
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn admit(
        self: &Arc<Self>,
        mut stream: TcpStream,
        remote: SocketAddr,
        token: &CancellationToken,
    ) {
        let (conn, rx) = TcpConnection::new(self.config.connection.clone());
        let admitted = {
            let mut pool = self.connections.lock();
            pool.retain(|c| {
                !matches!(
                    c.status(),
                    ConnectionStatus::Disconnected | ConnectionStatus::Error
                )
            });
            if pool.len() >= self.config.max_connections || token.is_cancelled() {
                false
            } else {
                conn.mark_connecting();
                pool.push(conn.clone());
                true
            }
        };

        if !admitted {
            debug!("Connection pool full, rejecting {}", remote);
            let _ = stream.shutdown().await;
            return;
        }

        let id = conn.id();
        debug!("Accepted connection {} from {}", id, remote);
        self.emit(ServerEvent::NewConnection {
            id,
            remote: Some(remote),
        })
        .await;
        conn.attach_stream(stream).await;
        tokio::spawn(Arc::clone(self).forward(id, rx));
    }

    /// Relabel one connection's events with its id.
    async fn forward(self: Arc<Self>, id: ConnectionId, mut rx: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = rx.recv().await {
            let event = match event {
                ConnectionEvent::Open => continue,
                ConnectionEvent::Message(data) => ServerEvent::Message { id, data },
                ConnectionEvent::Error { code, message } => {
                    ServerEvent::ConnectionError { id, code, message }
                }
                ConnectionEvent::Close => ServerEvent::ConnectionClosed { id },
            };
            self.emit(event).await;
        }
    }
}
