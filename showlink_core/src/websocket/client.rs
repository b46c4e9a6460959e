//! WebSocket client over a raw-framed [`TcpConnection`].

use crate::error::{CODE_PROTOCOL, CODE_TIMEOUT, Result, TransportError};
use crate::tcp::{ConnectionEvent, Framing, TcpConnection, TcpConnectionConfig};
use crate::watchdog::Watchdog;
use crate::websocket::frame::{DEFAULT_MAX_FRAME_SIZE, OpCode};
use crate::websocket::handshake;
use crate::websocket::session::{
    CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, Role, SessionOutput, WsMessage, WsSession,
};
use crate::websocket::WsEvent;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct WebSocketClientConfig {
    pub local_ip: Option<IpAddr>,
    /// Bounds the TCP connect and, separately, the upgrade handshake.
    pub connect_timeout: Duration,
    /// Ping interval; `None` disables pings and the watchdog.
    pub keep_alive: Option<Duration>,
    pub disable_watchdog: bool,
    pub max_connect_attempts: u32,
    /// Outgoing messages above this size are fragmented.
    pub max_frame_size: usize,
    pub event_capacity: usize,
}

impl Default for WebSocketClientConfig {
    fn default() -> Self {
        Self {
            local_ip: None,
            connect_timeout: Duration::from_secs(5),
            keep_alive: None,
            disable_watchdog: false,
            max_connect_attempts: 5,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Handshaking,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WsTarget {
    host: String,
    port: u16,
    host_header: String,
    path: String,
}

impl WsTarget {
    fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| TransportError::InvalidUrl(format!("{raw}: {e}")))?;
        if url.scheme() != "ws" {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{raw}: missing host")))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        Ok(Self {
            host,
            port,
            host_header,
            path,
        })
    }
}

#[derive(Clone)]
pub struct WebSocketClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: WebSocketClientConfig,
    state: Mutex<ClientState>,
    events: Mutex<Option<mpsc::Sender<WsEvent>>>,
    tcp: Mutex<Option<TcpConnection>>,
    session: Mutex<Option<WsSession>>,
    cancel: Mutex<Option<CancellationToken>>,
    watchdog: Watchdog,
    disposed: AtomicBool,
}

async fn handshake_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl WebSocketClient {
    pub fn new(config: WebSocketClientConfig) -> (Self, mpsc::Receiver<WsEvent>) {
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let inner = Arc::new(ClientInner {
            config,
            state: Mutex::new(ClientState::Idle),
            events: Mutex::new(Some(tx)),
            tcp: Mutex::new(None),
            session: Mutex::new(None),
            cancel: Mutex::new(None),
            watchdog: Watchdog::default(),
            disposed: AtomicBool::new(false),
        });
        (Self { inner }, rx)
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Open
    }

    /// Connect to a `ws://host[:port]/path` URL. Completion is reported by
    /// an `Open` event, failure by `Error`.
    pub async fn connect(&self, url: &str) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        let target = WsTarget::parse(url)?;
        {
            let mut state = self.inner.state.lock();
            if matches!(
                *state,
                ClientState::Connecting | ClientState::Handshaking | ClientState::Open
            ) {
                return Ok(());
            }
            *state = ClientState::Connecting;
        }

        let config = &self.inner.config;
        let (tcp, rx) = TcpConnection::new(TcpConnectionConfig {
            local_ip: config.local_ip,
            framing: Framing::Raw,
            connect_timeout: config.connect_timeout,
            max_connect_attempts: config.max_connect_attempts,
            ..Default::default()
        });

        let previous = self.inner.tcp.lock().replace(tcp.clone());
        if let Some(previous) = previous {
            previous.dispose().await;
        }

        let token = CancellationToken::new();
        if let Some(old) = self.inner.cancel.lock().replace(token.clone()) {
            old.cancel();
        }
        tokio::spawn(Arc::clone(&self.inner).pump(tcp.clone(), rx, target.clone(), token));
        debug!("WebSocket connecting to {}:{}{}", target.host, target.port, target.path);
        tcp.connect(&target.host, target.port)
    }

    pub async fn send(&self, message: WsMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let wire = match self.inner.session.lock().as_ref() {
            Some(session) => session.encode_message(&message),
            None => return Err(TransportError::NotConnected),
        };
        let tcp = self.inner.tcp.lock().clone().ok_or(TransportError::NotConnected)?;
        tcp.send(&wire).await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(WsMessage::Text(text.to_string())).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(WsMessage::Binary(data.into())).await
    }

    /// Send a close frame and drop the link. No `Close` event is raised.
    pub async fn disconnect(&self) {
        let was_open = {
            let mut state = self.inner.state.lock();
            let was_open = *state == ClientState::Open;
            *state = ClientState::Closed;
            was_open
        };
        if let Some(token) = self.inner.cancel.lock().take() {
            token.cancel();
        }
        let tcp = self.inner.tcp.lock().take();
        let Some(tcp) = tcp else {
            return;
        };
        if was_open {
            let close = self
                .inner
                .session
                .lock()
                .as_mut()
                .map(|s| s.encode_close(CLOSE_NORMAL, ""));
            if let Some(close) = close {
                let _ = tcp.send(&close).await;
            }
        }
        tcp.dispose().await;
        self.inner.session.lock().take();
    }

    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.events.lock().take();
        self.disconnect().await;
    }
}

impl ClientInner {
    async fn emit(&self, event: WsEvent) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Move to `Closed`; true if this call performed the transition.
    fn close_state(&self) -> bool {
        let mut state = self.state.lock();
        let live = matches!(
            *state,
            ClientState::Connecting | ClientState::Handshaking | ClientState::Open
        );
        *state = ClientState::Closed;
        live
    }

    async fn fail(&self, tcp: &TcpConnection, code: i32, message: String) {
        if !self.close_state() {
            return;
        }
        warn!("WebSocket client error {}: {}", code, message);
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        self.emit(WsEvent::Error { code, message }).await;
        tcp.disconnect().await;
        self.emit(WsEvent::Close).await;
    }

    async fn pump(
        self: Arc<Self>,
        tcp: TcpConnection,
        mut rx: mpsc::Receiver<ConnectionEvent>,
        target: WsTarget,
        token: CancellationToken,
    ) {
        let mut head = BytesMut::new();
        let mut key = String::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return,
                _ = handshake_deadline(deadline) => {
                    self.fail(&tcp, CODE_TIMEOUT, "upgrade handshake timed out".into()).await;
                    return;
                }
                ev = rx.recv() => ev,
            };
            let Some(event) = event else {
                return;
            };

            match event {
                ConnectionEvent::Open => {
                    key = handshake::generate_key();
                    head.clear();
                    *self.state.lock() = ClientState::Handshaking;
                    deadline = Some(Instant::now() + self.config.connect_timeout);
                    let request = handshake::client_request(&target.host_header, &target.path, &key);
                    // A failed write surfaces as Error/Close from the TCP layer.
                    let _ = tcp.send(request.as_bytes()).await;
                }
                ConnectionEvent::Message(data) => {
                    self.watchdog.feed();
                    let state = *self.state.lock();
                    match state {
                        ClientState::Handshaking => {
                            head.extend_from_slice(&data);
                            let parsed = handshake::parse_head(&head).and_then(|parsed| {
                                parsed
                                    .map(|(response, used)| {
                                        handshake::validate_response(&response, &key).map(|_| used)
                                    })
                                    .transpose()
                            });
                            match parsed {
                                Ok(None) => {}
                                Ok(Some(used)) => {
                                    deadline = None;
                                    let rest = head.split_off(used);
                                    head.clear();
                                    self.open(&token).await;
                                    if !rest.is_empty() && !self.process(&tcp, &rest).await {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    self.fail(&tcp, CODE_PROTOCOL, e.to_string()).await;
                                    return;
                                }
                            }
                        }
                        ClientState::Open => {
                            if !self.process(&tcp, &data).await {
                                return;
                            }
                        }
                        _ => {}
                    }
                }
                ConnectionEvent::Error { code, message } => {
                    let state = *self.state.lock();
                    if state == ClientState::Connecting {
                        // Connect attempts are exhausted; nothing follows.
                        self.close_state();
                        self.emit(WsEvent::Error { code, message }).await;
                        return;
                    }
                    self.emit(WsEvent::Error { code, message }).await;
                }
                ConnectionEvent::Close => {
                    if self.close_state() {
                        token.cancel();
                        self.emit(WsEvent::Close).await;
                    }
                    return;
                }
            }
        }
    }

    async fn open(self: &Arc<Self>, token: &CancellationToken) {
        *self.session.lock() = Some(WsSession::new(Role::Client, self.config.max_frame_size));
        *self.state.lock() = ClientState::Open;
        self.watchdog.feed();
        info!("WebSocket client upgraded");
        self.emit(WsEvent::Open).await;

        if let Some(period) = self.config.keep_alive {
            tokio::spawn(Arc::clone(self).keep_alive_loop(period, token.clone()));
        }
    }

    /// Feed received bytes to the session. Returns false once the session ended.
    async fn process(&self, tcp: &TcpConnection, data: &[u8]) -> bool {
        let fed = match self.session.lock().as_mut() {
            Some(session) => session.feed(data),
            None => return false,
        };

        match fed {
            Ok(outputs) => {
                for output in outputs {
                    match output {
                        SessionOutput::Message(message) => {
                            self.emit(WsEvent::Message(message)).await
                        }
                        SessionOutput::Reply(frame) => {
                            let _ = tcp.send(&frame).await;
                        }
                        SessionOutput::Alive => {}
                        SessionOutput::Closed { code, reason } => {
                            debug!("Server closed the WebSocket: {} {}", code, reason);
                            if self.close_state() {
                                if let Some(token) = self.cancel.lock().take() {
                                    token.cancel();
                                }
                                tcp.disconnect().await;
                                self.emit(WsEvent::Close).await;
                            }
                            return false;
                        }
                    }
                }
                true
            }
            Err(e) => {
                let close = self
                    .session
                    .lock()
                    .as_mut()
                    .map(|s| s.encode_close(CLOSE_PROTOCOL_ERROR, ""));
                if let Some(close) = close {
                    let _ = tcp.send(&close).await;
                }
                self.fail(tcp, e.code(), e.to_string()).await;
                false
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
            let tcp = self.tcp.lock().clone();
            let Some(tcp) = tcp else {
                return;
            };

            if !self.config.disable_watchdog && self.watchdog.tick() {
                self.fail(&tcp, CODE_TIMEOUT, "keep-alive watchdog expired".into())
                    .await;
                return;
            }
            let ping = self
                .session
                .lock()
                .as_ref()
                .map(|s| s.encode_control(OpCode::Ping, &[]));
            if let Some(ping) = ping {
                let _ = tcp.send(&ping).await;
            }
        }
    }
}
