//! Answers NTP requests from a local [`SyncedClock`] over UDP, TCP and
//! WebSocket, for hosts that cannot reach an NTP server directly.

use crate::error::Result;
use crate::tcp::{ConnectionId, Framing, ServerEvent, TcpConnectionConfig, TcpServer, TcpServerConfig};
use crate::timesync::clock::SyncedClock;
use crate::timesync::ntp::{self, NTP_PACKET_SIZE};
use crate::udp::{UdpConnection, UdpConnectionConfig, UdpEvent};
use crate::websocket::{WebSocketServer, WebSocketServerConfig, WsMessage, WsServerEvent};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct TimeRelayConfig {
    pub local_ip: Option<IpAddr>,
    /// Listener ports; `None` disables that transport. Port 0 picks a free port.
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub ws_port: Option<u16>,
}

/// Bound addresses of the running listeners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayAddrs {
    pub udp: Option<SocketAddr>,
    pub tcp: Option<SocketAddr>,
    pub ws: Option<SocketAddr>,
}

pub struct TimeRelay {
    clock: Arc<SyncedClock>,
    udp: Option<UdpConnection>,
    tcp: Option<TcpServer>,
    ws: Option<WebSocketServer>,
    addrs: RelayAddrs,
}

impl TimeRelay {
    pub async fn start(config: TimeRelayConfig, clock: Arc<SyncedClock>) -> Result<Self> {
        let mut relay = Self {
            clock,
            udp: None,
            tcp: None,
            ws: None,
            addrs: RelayAddrs::default(),
        };

        if let Some(port) = config.udp_port {
            let (udp, rx) = UdpConnection::new(UdpConnectionConfig {
                port,
                local_ip: config.local_ip,
                broadcast: false,
                ..Default::default()
            });
            let addr = udp.connect(None).await?;
            tokio::spawn(udp_pump(udp.clone(), rx, Arc::clone(&relay.clock)));
            info!("Time relay answering NTP over UDP on {}", addr);
            relay.addrs.udp = Some(addr);
            relay.udp = Some(udp);
        }

        if let Some(port) = config.tcp_port {
            let (server, rx) = TcpServer::new(TcpServerConfig {
                port,
                local_ip: config.local_ip,
                connection: TcpConnectionConfig {
                    framing: Framing::Raw,
                    disable_watchdog: true,
                    ..Default::default()
                },
                ..Default::default()
            });
            let addr = server.start().await?;
            tokio::spawn(tcp_pump(server.clone(), rx, Arc::clone(&relay.clock)));
            info!("Time relay answering NTP over TCP on {}", addr);
            relay.addrs.tcp = Some(addr);
            relay.tcp = Some(server);
        }

        if let Some(port) = config.ws_port {
            let (server, rx) = WebSocketServer::new(WebSocketServerConfig {
                port,
                local_ip: config.local_ip,
                ..Default::default()
            });
            let addr = server.start().await?;
            tokio::spawn(ws_pump(server.clone(), rx, Arc::clone(&relay.clock)));
            info!("Time relay answering NTP over WebSocket on {}", addr);
            relay.addrs.ws = Some(addr);
            relay.ws = Some(server);
        }

        Ok(relay)
    }

    pub fn addrs(&self) -> RelayAddrs {
        self.addrs
    }

    pub fn clock(&self) -> &Arc<SyncedClock> {
        &self.clock
    }

    pub async fn dispose(&self) {
        if let Some(udp) = &self.udp {
            udp.dispose().await;
        }
        if let Some(tcp) = &self.tcp {
            tcp.dispose().await;
        }
        if let Some(ws) = &self.ws {
            ws.dispose().await;
        }
    }
}

fn reply(clock: &SyncedClock) -> Bytes {
    Bytes::copy_from_slice(&ntp::server_reply(clock.now()))
}

async fn udp_pump(udp: UdpConnection, mut rx: mpsc::Receiver<UdpEvent>, clock: Arc<SyncedClock>) {
    while let Some(event) = rx.recv().await {
        match event {
            UdpEvent::Message { from, data } if ntp::is_client_request(&data) => {
                if let Err(e) = udp.send_to_addr(from, &reply(&clock)).await {
                    debug!("NTP reply to {} failed: {}", from, e);
                }
            }
            UdpEvent::Message { from, .. } => debug!("Ignoring non-NTP datagram from {}", from),
            UdpEvent::Close => return,
            _ => {}
        }
    }
}

async fn tcp_pump(server: TcpServer, mut rx: mpsc::Receiver<ServerEvent>, clock: Arc<SyncedClock>) {
    let mut pending: HashMap<ConnectionId, BytesMut> = HashMap::new();
    while let Some(event) = rx.recv().await {
        match event {
            ServerEvent::Message { id, data } => {
                let buf = pending.entry(id).or_default();
                buf.extend_from_slice(&data);
                while buf.len() >= NTP_PACKET_SIZE {
                    let request = buf.split_to(NTP_PACKET_SIZE);
                    if !ntp::is_client_request(&request) {
                        debug!("Ignoring non-NTP frame on connection {}", id);
                        continue;
                    }
                    if let Some(conn) = server.connection_by_id(id) {
                        let _ = conn.send(&reply(&clock)).await;
                    }
                }
            }
            ServerEvent::ConnectionClosed { id } | ServerEvent::ConnectionError { id, .. } => {
                pending.remove(&id);
            }
            ServerEvent::Closed => return,
            _ => {}
        }
    }
}

async fn ws_pump(
    server: WebSocketServer,
    mut rx: mpsc::Receiver<WsServerEvent>,
    clock: Arc<SyncedClock>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            WsServerEvent::Message {
                id,
                message: WsMessage::Binary(data),
            } if ntp::is_client_request(&data) => {
                let _ = server.send(id, &WsMessage::Binary(reply(&clock))).await;
            }
            WsServerEvent::Message { id, .. } => {
                debug!("Ignoring non-NTP message on connection {}", id)
            }
            WsServerEvent::Closed => return,
            _ => {}
        }
    }
}
