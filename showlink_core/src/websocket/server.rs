//! WebSocket server: a raw-framed [`TcpServer`] plus per-connection upgrade
//! and session state, driven by a single event pump.

use crate::error::{CODE_PROTOCOL, Result};
use crate::tcp::{ConnectionId, Framing, ServerEvent, TcpServer, TcpServerConfig};
use crate::websocket::frame::{DEFAULT_MAX_FRAME_SIZE, OpCode};
use crate::websocket::handshake;
use crate::websocket::session::{CLOSE_PROTOCOL_ERROR, Role, SessionOutput, WsMessage, WsSession};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum WsServerEvent {
    Listening(SocketAddr),
    /// A client completed the upgrade handshake.
    NewConnection {
        id: ConnectionId,
        remote: Option<SocketAddr>,
    },
    Message {
        id: ConnectionId,
        message: WsMessage,
    },
    ConnectionClosed {
        id: ConnectionId,
    },
    Error {
        id: Option<ConnectionId>,
        code: i32,
        message: String,
    },
    Closed,
}

#[derive(Debug, Clone)]
pub struct WebSocketServerConfig {
    pub port: u16,
    pub local_ip: Option<IpAddr>,
    pub max_connections: usize,
    /// Interval of server-initiated pings to upgraded clients.
    pub keep_alive: Option<Duration>,
    pub max_frame_size: usize,
    pub event_capacity: usize,
}

impl Default for WebSocketServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            local_ip: None,
            max_connections: 64,
            keep_alive: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            event_capacity: 1024,
        }
    }
}

enum Peer {
    Handshaking {
        head: BytesMut,
        remote: Option<SocketAddr>,
    },
    Open(WsSession),
}

#[derive(Clone)]
pub struct WebSocketServer {
    inner: Arc<WsServerInner>,
}

struct WsServerInner {
    config: WebSocketServerConfig,
    tcp: TcpServer,
    tcp_events: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    events: Mutex<Option<mpsc::Sender<WsServerEvent>>>,
    upgraded: Mutex<HashSet<ConnectionId>>,
    /// Encoder for outgoing server frames; unmasked and stateless.
    encoder: WsSession,
    cancel: Mutex<Option<CancellationToken>>,
}

impl WebSocketServer {
    pub fn new(config: WebSocketServerConfig) -> (Self, mpsc::Receiver<WsServerEvent>) {
        let (tcp, tcp_rx) = TcpServer::new(TcpServerConfig {
            port: config.port,
            local_ip: config.local_ip,
            max_connections: config.max_connections,
            connection: crate::tcp::TcpConnectionConfig {
                framing: Framing::Raw,
                ..Default::default()
            },
            event_capacity: config.event_capacity,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let encoder = WsSession::new(Role::Server, config.max_frame_size);
        let inner = Arc::new(WsServerInner {
            config,
            tcp,
            tcp_events: Mutex::new(Some(tcp_rx)),
            events: Mutex::new(Some(tx)),
            upgraded: Mutex::new(HashSet::new()),
            encoder,
            cancel: Mutex::new(None),
        });
        (Self { inner }, rx)
    }

    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = self.inner.tcp.start().await?;
        let token = CancellationToken::new();
        if let Some(old) = self.inner.cancel.lock().replace(token.clone()) {
            old.cancel();
        }
        let tcp_rx = self.inner.tcp_events.lock().take();
        if let Some(tcp_rx) = tcp_rx {
            tokio::spawn(Arc::clone(&self.inner).pump(tcp_rx));
        }
        if let Some(period) = self.inner.config.keep_alive {
            tokio::spawn(Arc::clone(&self.inner).keep_alive_loop(period, token));
        }
        info!("WebSocket server listening on {}", addr);
        Ok(addr)
    }

    pub async fn stop(&self) {
        if let Some(token) = self.inner.cancel.lock().take() {
            token.cancel();
        }
        self.inner.upgraded.lock().clear();
        self.inner.tcp.stop().await;
    }

    pub async fn dispose(&self) {
        self.inner.events.lock().take();
        self.stop().await;
        self.inner.tcp.dispose().await;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.tcp.local_addr()
    }

    /// Number of upgraded sessions.
    pub fn connections_count(&self) -> usize {
        self.inner.upgraded.lock().len()
    }

    pub async fn send(&self, id: ConnectionId, message: &WsMessage) -> Result<()> {
        if !self.inner.upgraded.lock().contains(&id) {
            return Err(crate::error::TransportError::NotConnected);
        }
        let conn = self
            .inner
            .tcp
            .connection_by_id(id)
            .ok_or(crate::error::TransportError::NotConnected)?;
        conn.send(&self.inner.encoder.encode_message(message)).await
    }

    /// Send to every upgraded session; returns how many accepted it.
    pub async fn broadcast(&self, message: &WsMessage) -> usize {
        let ids: Vec<ConnectionId> = self.inner.upgraded.lock().iter().copied().collect();
        let mut delivered = 0;
        for id in ids {
            if self.send(id, message).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close one session with a normal close frame. No event is raised.
    pub async fn close_connection(&self, id: ConnectionId) {
        self.inner.upgraded.lock().remove(&id);
        if let Some(conn) = self.inner.tcp.connection_by_id(id) {
            let close = self.inner.encoder.encode_control(
                OpCode::Close,
                &crate::websocket::frame::close_payload(1000, ""),
            );
            let _ = conn.send(&close).await;
            self.inner.tcp.close_connection(&conn).await;
        }
    }
}

impl WsServerInner {
    async fn emit(&self, event: WsServerEvent) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    async fn write(&self, id: ConnectionId, data: &[u8]) {
        if let Some(conn) = self.tcp.connection_by_id(id) {
            let _ = conn.send(data).await;
        }
    }

    async fn drop_connection(&self, id: ConnectionId) {
        self.upgraded.lock().remove(&id);
        if let Some(conn) = self.tcp.connection_by_id(id) {
            self.tcp.close_connection(&conn).await;
        }
    }

    async fn pump(self: Arc<Self>, mut rx: mpsc::Receiver<ServerEvent>) {
        let mut peers: HashMap<ConnectionId, Peer> = HashMap::new();

        while let Some(event) = rx.recv().await {
            match event {
                ServerEvent::Listening(addr) => self.emit(WsServerEvent::Listening(addr)).await,
                ServerEvent::NewConnection { id, remote } => {
                    peers.insert(
                        id,
                        Peer::Handshaking {
                            head: BytesMut::new(),
                            remote,
                        },
                    );
                }
                ServerEvent::Message { id, data } => {
                    let Some(peer) = peers.get_mut(&id) else {
                        continue;
                    };
                    let keep = match peer {
                        Peer::Handshaking { head, remote } => {
                            head.extend_from_slice(&data);
                            let remote = *remote;
                            match self.upgrade(id, head).await {
                                Ok(Some(rest)) => {
                                    let session =
                                        WsSession::new(Role::Server, self.config.max_frame_size);
                                    *peer = Peer::Open(session);
                                    self.upgraded.lock().insert(id);
                                    self.emit(WsServerEvent::NewConnection { id, remote }).await;
                                    if rest.is_empty() {
                                        true
                                    } else {
                                        self.process(id, peer, &rest).await
                                    }
                                }
                                Ok(None) => true,
                                Err(()) => false,
                            }
                        }
                        Peer::Open(_) => self.process(id, peer, &data).await,
                    };
                    if !keep {
                        peers.remove(&id);
                    }
                }
                ServerEvent::ConnectionError { id, code, message } => {
                    self.emit(WsServerEvent::Error {
                        id: Some(id),
                        code,
                        message,
                    })
                    .await;
                }
                ServerEvent::ConnectionClosed { id } => {
                    self.upgraded.lock().remove(&id);
                    if let Some(Peer::Open(_)) = peers.remove(&id) {
                        self.emit(WsServerEvent::ConnectionClosed { id }).await;
                    }
                }
                ServerEvent::Error { code, message } => {
                    self.emit(WsServerEvent::Error {
                        id: None,
                        code,
                        message,
                    })
                    .await;
                }
                ServerEvent::Closed => {
                    peers.clear();
                    self.emit(WsServerEvent::Closed).await;
                }
            }
        }
    }

    /// Try to complete the upgrade. `Ok(Some(rest))` carries bytes that
    /// followed the request head; `Err` means the connection was refused.
    async fn upgrade(&self, id: ConnectionId, head: &mut BytesMut) -> std::result::Result<Option<Bytes>, ()> {
        let request = handshake::parse_head(head).and_then(|parsed| {
            parsed
                .map(|(request, used)| handshake::validate_request(&request).map(|key| (key, used)))
                .transpose()
        });

        match request {
            Ok(None) => Ok(None),
            Ok(Some((key, used))) => {
                let rest = head.split_off(used).freeze();
                head.clear();
                self.write(id, handshake::accept_response(&key).as_bytes()).await;
                debug!("Connection {} upgraded to WebSocket", id);
                Ok(Some(rest))
            }
            Err(e) => {
                warn!("Rejecting upgrade from connection {}: {}", id, e);
                self.write(id, handshake::bad_request_response(&e.to_string()).as_bytes())
                    .await;
                self.drop_connection(id).await;
                self.emit(WsServerEvent::Error {
                    id: Some(id),
                    code: CODE_PROTOCOL,
                    message: e.to_string(),
                })
                .await;
                Err(())
            }
        }
    }

    /// Returns false once the session has ended.
    async fn process(&self, id: ConnectionId, peer: &mut Peer, data: &[u8]) -> bool {
        let Peer::Open(session) = peer else {
            return false;
        };

        match session.feed(data) {
            Ok(outputs) => {
                for output in outputs {
                    match output {
                        SessionOutput::Message(message) => {
                            self.emit(WsServerEvent::Message { id, message }).await
                        }
                        SessionOutput::Reply(frame) => self.write(id, &frame).await,
                        SessionOutput::Alive => {}
                        SessionOutput::Closed { code, .. } => {
                            debug!("Connection {} closed the WebSocket ({})", id, code);
                            self.drop_connection(id).await;
                            self.emit(WsServerEvent::ConnectionClosed { id }).await;
                            return false;
                        }
                    }
                }
                true
            }
            Err(e) => {
                warn!("Aborting connection {}: {}", id, e);
                let close = session.encode_close(CLOSE_PROTOCOL_ERROR, "");
                self.write(id, &close).await;
                self.drop_connection(id).await;
                self.emit(WsServerEvent::Error {
                    id: Some(id),
                    code: e.code(),
                    message: e.to_string(),
                })
                .await;
                self.emit(WsServerEvent::ConnectionClosed { id }).await;
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
            let ping = self.encoder.encode_control(OpCode::Ping, &[]);
            let ids: Vec<ConnectionId> = self.upgraded.lock().iter().copied().collect();
            for id in ids {
                self.write(id, &ping).await;
            }
        }
    }
}
