//! A single TCP connection with delimiter framing, reconnect and watchdog.

use crate::address;
use crate::error::{CODE_TIMEOUT, Result, TransportError};
use crate::tcp::framing::{DEFAULT_MAX_MESSAGE_SIZE, DelimitedBuffer, Framing};
use crate::watchdog::Watchdog;
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between failed connect attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub type ConnectionId = u64;

pub(crate) fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Events reported by a connection to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Open,
    Message(Bytes),
    Error { code: i32, message: String },
    /// The link was lost for a reason other than a local `disconnect`.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Error,
}

#[derive(Debug, Clone)]
pub struct TcpConnectionConfig {
    /// Local address to bind before connecting.
    pub local_ip: Option<IpAddr>,
    pub framing: Framing,
    pub connect_timeout: Duration,
    /// Interval between keep-alives; `None` disables them.
    pub keep_alive: Option<Duration>,
    pub disable_watchdog: bool,
    /// Attempts before a connect gives up; 0 retries forever.
    pub max_connect_attempts: u32,
    /// Reconnect after the link is lost unexpectedly.
    pub auto_reconnect: bool,
    pub read_buffer_size: usize,
    /// Largest delimited message accepted before the link is dropped.
    pub max_message_size: usize,
    pub event_capacity: usize,
}

impl Default for TcpConnectionConfig {
    fn default() -> Self {
        Self {
            local_ip: None,
            framing: Framing::default(),
            connect_timeout: Duration::from_secs(5),
            keep_alive: None,
            disable_watchdog: false,
            max_connect_attempts: 5,
            auto_reconnect: false,
            read_buffer_size: 64 * 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            event_capacity: 1024,
        }
    }
}

/// Handle to a TCP connection. Clones share the same socket.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    config: TcpConnectionConfig,
    status: Mutex<ConnectionStatus>,
    events: Mutex<Option<mpsc::Sender<ConnectionEvent>>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    session: Mutex<Option<CancellationToken>>,
    connector: Mutex<Option<CancellationToken>>,
    target: Mutex<Option<(String, u16)>>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    watchdog: Watchdog,
    disposed: AtomicBool,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("remote", &self.remote_addr())
            .finish()
    }
}

impl TcpConnection {
    /// Create an idle connection and the receiver for its events.
    pub fn new(config: TcpConnectionConfig) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let inner = Arc::new(Inner {
            id: next_connection_id(),
            config,
            status: Mutex::new(ConnectionStatus::Disconnected),
            events: Mutex::new(Some(tx)),
            writer: tokio::sync::Mutex::new(None),
            session: Mutex::new(None),
            connector: Mutex::new(None),
            target: Mutex::new(None),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            watchdog: Watchdog::default(),
            disposed: AtomicBool::new(false),
        });
        (Self { inner }, rx)
    }

    /// Wrap an already established stream (server side).
    pub async fn from_stream(
        stream: TcpStream,
        config: TcpConnectionConfig,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (conn, rx) = Self::new(config);
        conn.inner.attach(stream).await;
        (conn, rx)
    }

    /// Reserve a freshly created connection for an incoming stream.
    pub(crate) fn mark_connecting(&self) {
        *self.inner.status.lock() = ConnectionStatus::Connecting;
    }

    pub(crate) async fn attach_stream(&self, stream: TcpStream) {
        self.inner.attach(stream).await;
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.inner.remote_addr.lock()
    }

    pub fn config(&self) -> &TcpConnectionConfig {
        &self.inner.config
    }

    /// Start connecting in the background. Progress is reported as events:
    /// `Open` on success, `Error` once all attempts are used up.
    pub fn connect(&self, remote_host: &str, port: u16) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        {
            let mut status = self.inner.status.lock();
            if matches!(*status, ConnectionStatus::Open | ConnectionStatus::Connecting) {
                return Ok(());
            }
            *status = ConnectionStatus::Connecting;
        }
        *self.inner.target.lock() = Some((remote_host.to_string(), port));
        self.inner.spawn_connect(remote_host.to_string(), port);
        Ok(())
    }

    /// Send one message; the framing delimiter is appended.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let frame = self.inner.config.framing.encode(data);
        self.inner.write_raw(&frame).await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(text.as_bytes()).await
    }

    /// Close the socket and stop all timers. No `Close` event is raised.
    pub async fn disconnect(&self) {
        self.inner.teardown().await;
    }

    /// Detach event delivery, then disconnect. Safe to call repeatedly.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.events.lock().take();
        self.inner.target.lock().take();
        self.inner.teardown().await;
    }
}

impl Inner {
    async fn emit(&self, event: ConnectionEvent) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    fn spawn_connect(self: &Arc<Self>, host: String, port: u16) {
        let token = CancellationToken::new();
        if let Some(previous) = self.connector.lock().replace(token.clone()) {
            previous.cancel();
        }
        let inner = Arc::clone(self);
        let task: Pin<Box<dyn Future<Output = ()> + Send>> =
            Box::pin(async move { inner.connect_loop(host, port, token).await });
        tokio::spawn(task);
    }

    async fn connect_loop(self: Arc<Self>, host: String, port: u16, token: CancellationToken) {
        *self.status.lock() = ConnectionStatus::Connecting;
        let max = self.config.max_connect_attempts;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = token.cancelled() => return,
                r = self.try_connect(&host, port) => r,
            };

            match result {
                Ok(stream) => {
                    if token.is_cancelled() {
                        return;
                    }
                    self.connector.lock().take();
                    info!("[tcp:{}] connected to {}:{}", self.id, host, port);
                    self.attach(stream).await;
                    return;
                }
                Err(e) => {
                    debug!(
                        "[tcp:{}] connect attempt {} to {}:{} failed: {}",
                        self.id, attempt, host, port, e
                    );
                    if max > 0 && attempt >= max {
                        warn!("[tcp:{}] giving up on {}:{}: {}", self.id, host, port, e);
                        *self.status.lock() = ConnectionStatus::Error;
                        self.connector.lock().take();
                        let err = TransportError::AttemptsExhausted {
                            attempts: attempt,
                            last: e.to_string(),
                        };
                        self.emit(ConnectionEvent::Error {
                            code: err.code(),
                            message: err.to_string(),
                        })
                        .await;
                        return;
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn try_connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addr = address::resolve(host, port).await?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = self.config.local_ip {
            socket.bind(SocketAddr::new(local, 0))?;
        }

        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Install a connected stream as the current session and start its loops.
    async fn attach(self: &Arc<Self>, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        *self.local_addr.lock() = stream.local_addr().ok();
        *self.remote_addr.lock() = stream.peer_addr().ok();

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        let token = CancellationToken::new();
        if let Some(old) = self.session.lock().replace(token.clone()) {
            old.cancel();
        }
        *self.status.lock() = ConnectionStatus::Open;
        self.watchdog.feed();
        self.emit(ConnectionEvent::Open).await;

        tokio::spawn(Arc::clone(self).read_loop(reader, token.clone()));
        if let Some(period) = self.config.keep_alive {
            tokio::spawn(Arc::clone(self).keep_alive_loop(period, token));
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, token: CancellationToken) {
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];
        let mut framer = match &self.config.framing {
            Framing::Delimited(delimiter) => Some(DelimitedBuffer::with_limit(
                delimiter,
                self.config.max_message_size,
            )),
            Framing::Raw => None,
        };

        loop {
            let read = tokio::select! {
                _ = token.cancelled() => return,
                r = reader.read(&mut buf) => r,
            };

            match read {
                Ok(0) => {
                    debug!("[tcp:{}] remote closed the stream", self.id);
                    self.connection_lost(&token, None).await;
                    return;
                }
                Ok(n) => {
                    self.watchdog.feed();
                    match framer.as_mut() {
                        Some(framer) => match framer.push(&buf[..n]) {
                            Ok(messages) => {
                                for message in messages {
                                    // Empty messages are keep-alives.
                                    if !message.is_empty() {
                                        self.emit(ConnectionEvent::Message(message)).await;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("[tcp:{}] dropping link: {}", self.id, e);
                                let err = TransportError::Protocol(e.to_string());
                                self.connection_lost(&token, Some((err.code(), err.to_string())))
                                    .await;
                                return;
                            }
                        },
                        None => {
                            self.emit(ConnectionEvent::Message(Bytes::copy_from_slice(&buf[..n])))
                                .await;
                        }
                    }
                }
                Err(e) => {
                    let err = TransportError::Io(e);
                    self.connection_lost(&token, Some((err.code(), err.to_string())))
                        .await;
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

            if !self.config.disable_watchdog && self.watchdog.tick() {
                warn!("[tcp:{}] no traffic for 3 keep-alive intervals", self.id);
                self.connection_lost(
                    &token,
                    Some((CODE_TIMEOUT, "keep-alive watchdog expired".to_string())),
                )
                .await;
                return;
            }

            if let Some(ping) = self.config.framing.keep_alive() {
                if self.write_raw(&ping).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn write_raw(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        let result = {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
            writer.write_all(data).await
        };

        if let Err(e) = result {
            let err = TransportError::Io(e);
            let token = self.session.lock().clone();
            if let Some(token) = token {
                self.connection_lost(&token, Some((err.code(), err.to_string())))
                    .await;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Tear down the session `token` belongs to after an unexpected loss.
    async fn connection_lost(
        self: &Arc<Self>,
        token: &CancellationToken,
        error: Option<(i32, String)>,
    ) {
        let is_current = {
            let mut session = self.session.lock();
            if token.is_cancelled() || session.is_none() {
                false
            } else {
                if let Some(current) = session.take() {
                    current.cancel();
                }
                true
            }
        };
        if !is_current {
            return;
        }

        *self.status.lock() = ConnectionStatus::Disconnected;
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some((code, message)) = error {
            self.emit(ConnectionEvent::Error { code, message }).await;
        }
        self.emit(ConnectionEvent::Close).await;

        if self.config.auto_reconnect && !self.disposed.load(Ordering::SeqCst) {
            let target = self.target.lock().clone();
            if let Some((host, port)) = target {
                info!("[tcp:{}] link lost, reconnecting to {}:{}", self.id, host, port);
                *self.status.lock() = ConnectionStatus::Connecting;
                self.spawn_connect(host, port);
            }
        }
    }

    async fn teardown(&self) {
        if let Some(connector) = self.connector.lock().take() {
            connector.cancel();
        }
        let session = self.session.lock().take();
        if let Some(token) = session {
            token.cancel();
        }

        *self.status.lock() = ConnectionStatus::Closing;
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        *self.status.lock() = ConnectionStatus::Disconnected;
    }
}
