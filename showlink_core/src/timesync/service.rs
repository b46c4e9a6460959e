//! Keeps a [`SyncedClock`] in step with an NTP server or a [`TimeRelay`].
//!
//! [`TimeRelay`]: crate::timesync::TimeRelay

use crate::address;
use crate::error::{CODE_PROTOCOL, CODE_TIMEOUT, TransportError};
use crate::tcp::{ConnectionEvent, Framing, TcpConnection, TcpConnectionConfig};
use crate::timesync::clock::SyncedClock;
use crate::timesync::ntp::{self, NTP_PACKET_SIZE, NTP_PORT};
use crate::udp::{UdpConnection, UdpConnectionConfig, UdpEvent};
use crate::websocket::{WebSocketClient, WebSocketClientConfig, WsEvent, WsMessage};
use bytes::BytesMut;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_SYNC_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSyncTransport {
    #[default]
    Udp,
    Tcp,
    #[serde(rename = "websocket")]
    WebSocket,
}

#[derive(Debug, Clone)]
pub struct TimeSyncConfig {
    pub transport: TimeSyncTransport,
    /// NTP server or relay host for UDP and TCP.
    pub server: String,
    pub port: u16,
    /// `ws://` URL of a relay, used by the WebSocket transport.
    pub url: Option<String>,
    pub local_ip: Option<IpAddr>,
    pub attempts: u32,
    pub attempt_timeout: Duration,
    /// Period of background resyncs; `None` syncs only on demand.
    pub resync_interval: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            transport: TimeSyncTransport::Udp,
            server: "pool.ntp.org".to_string(),
            port: NTP_PORT,
            url: None,
            local_ip: None,
            attempts: DEFAULT_SYNC_ATTEMPTS,
            attempt_timeout: Duration::from_secs(2),
            resync_interval: Some(Duration::from_secs(600)),
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeSyncEvent {
    Synced {
        utc: DateTime<Utc>,
        /// Synced time minus system time.
        offset: TimeDelta,
    },
    Error {
        code: i32,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum TimeSyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("invalid NTP reply")]
    InvalidReply,

    #[error("WebSocket transport needs a url")]
    MissingUrl,

    #[error("time sync failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("time sync service is disposed")]
    Disposed,
}

impl TimeSyncError {
    pub fn code(&self) -> i32 {
        match self {
            TimeSyncError::Transport(e) => e.code(),
            TimeSyncError::Timeout(_) | TimeSyncError::Exhausted { .. } => CODE_TIMEOUT,
            TimeSyncError::InvalidReply | TimeSyncError::MissingUrl => CODE_PROTOCOL,
            TimeSyncError::Disposed => crate::error::CODE_UNKNOWN,
        }
    }
}

#[derive(Clone)]
pub struct TimeSyncService {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    config: TimeSyncConfig,
    clock: Arc<SyncedClock>,
    events: Mutex<Option<mpsc::Sender<TimeSyncEvent>>>,
    /// Serializes sync runs so a resync never overlaps a manual one.
    running: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl TimeSyncService {
    /// Create the service and start the resync task when an interval is set.
    /// The first sync runs immediately on that task.
    pub fn start(config: TimeSyncConfig) -> (Self, mpsc::Receiver<TimeSyncEvent>) {
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let inner = Arc::new(SyncInner {
            config,
            clock: Arc::new(SyncedClock::new()),
            events: Mutex::new(Some(tx)),
            running: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });
        if let Some(period) = inner.config.resync_interval {
            tokio::spawn(Arc::clone(&inner).resync_loop(period));
        }
        (Self { inner }, rx)
    }

    pub fn clock(&self) -> Arc<SyncedClock> {
        Arc::clone(&self.inner.clock)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn is_synced(&self) -> bool {
        self.inner.clock.is_synced()
    }

    /// Query the time source, retrying up to the configured attempts.
    pub async fn sync_now(&self) -> Result<DateTime<Utc>, TimeSyncError> {
        self.inner.sync().await
    }

    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.events.lock().take();
        self.inner.cancel.cancel();
    }
}

impl SyncInner {
    async fn emit(&self, event: TimeSyncEvent) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    async fn resync_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sync().await {
                debug!("Scheduled time sync failed: {}", e);
            }
        }
    }

    async fn sync(&self) -> Result<DateTime<Utc>, TimeSyncError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TimeSyncError::Disposed);
        }
        let _running = self.running.lock().await;

        let attempts = self.config.attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TimeSyncError::Disposed),
                r = self.query() => r,
            };
            match result {
                Ok(utc) => {
                    self.clock.set(utc);
                    let offset = self.clock.offset();
                    info!(
                        "Clock synced over {:?} (offset {} ms, attempt {})",
                        self.config.transport,
                        offset.num_milliseconds(),
                        attempt
                    );
                    self.emit(TimeSyncEvent::Synced { utc, offset }).await;
                    return Ok(utc);
                }
                Err(TimeSyncError::MissingUrl) => {
                    last = TimeSyncError::MissingUrl.to_string();
                    break;
                }
                Err(e) => {
                    debug!("Time sync attempt {}/{} failed: {}", attempt, attempts, e);
                    last = e.to_string();
                }
            }
        }

        let err = TimeSyncError::Exhausted { attempts, last };
        warn!("{}", err);
        self.emit(TimeSyncEvent::Error {
            code: err.code(),
            message: err.to_string(),
        })
        .await;
        Err(err)
    }

    async fn query(&self) -> Result<DateTime<Utc>, TimeSyncError> {
        let wait = self.config.attempt_timeout;
        let reply = match self.config.transport {
            TimeSyncTransport::Udp => query_udp(&self.config, wait).await?,
            TimeSyncTransport::Tcp => query_tcp(&self.config, wait).await?,
            TimeSyncTransport::WebSocket => query_ws(&self.config, wait).await?,
        };
        ntp::transmit_time(&reply).ok_or(TimeSyncError::InvalidReply)
    }
}

async fn query_udp(config: &TimeSyncConfig, wait: Duration) -> Result<Vec<u8>, TimeSyncError> {
    let remote = address::resolve(&config.server, config.port).await?;
    let (udp, mut rx) = UdpConnection::new(UdpConnectionConfig {
        local_ip: config.local_ip,
        broadcast: false,
        requested_buffer_size: None,
        event_capacity: 16,
        ..Default::default()
    });
    let result = tokio::time::timeout(wait, exchange_udp(&udp, &mut rx, remote)).await;
    udp.dispose().await;
    result.map_err(|_| TimeSyncError::Timeout(wait))?
}

async fn exchange_udp(
    udp: &UdpConnection,
    rx: &mut mpsc::Receiver<UdpEvent>,
    remote: std::net::SocketAddr,
) -> Result<Vec<u8>, TimeSyncError> {
    udp.connect(Some(remote)).await?;
    udp.send(&ntp::client_request()).await?;
    loop {
        match rx.recv().await {
            Some(UdpEvent::Message { data, .. }) if data.len() >= NTP_PACKET_SIZE => {
                return Ok(data[..NTP_PACKET_SIZE].to_vec());
            }
            Some(UdpEvent::Error { message, .. }) => {
                return Err(TransportError::Protocol(message).into());
            }
            Some(_) => {}
            None => return Err(TransportError::NotConnected.into()),
        }
    }
}

async fn query_tcp(config: &TimeSyncConfig, wait: Duration) -> Result<Vec<u8>, TimeSyncError> {
    let (tcp, mut rx) = TcpConnection::new(TcpConnectionConfig {
        local_ip: config.local_ip,
        framing: Framing::Raw,
        connect_timeout: wait,
        disable_watchdog: true,
        max_connect_attempts: 1,
        event_capacity: 16,
        ..Default::default()
    });
    let result = tokio::time::timeout(wait, exchange_tcp(&tcp, &mut rx, config)).await;
    tcp.dispose().await;
    result.map_err(|_| TimeSyncError::Timeout(wait))?
}

/// Raw TCP has no message boundaries; the reply may arrive in pieces.
async fn exchange_tcp(
    tcp: &TcpConnection,
    rx: &mut mpsc::Receiver<ConnectionEvent>,
    config: &TimeSyncConfig,
) -> Result<Vec<u8>, TimeSyncError> {
    tcp.connect(&config.server, config.port)?;
    let mut buf = BytesMut::with_capacity(NTP_PACKET_SIZE);
    loop {
        match rx.recv().await {
            Some(ConnectionEvent::Open) => tcp.send(&ntp::client_request()).await?,
            Some(ConnectionEvent::Message(data)) => {
                buf.extend_from_slice(&data);
                if buf.len() >= NTP_PACKET_SIZE {
                    return Ok(buf[..NTP_PACKET_SIZE].to_vec());
                }
            }
            Some(ConnectionEvent::Error { code, message }) => {
                debug!("TCP time source error {}: {}", code, message);
                return Err(TransportError::Protocol(message).into());
            }
            Some(ConnectionEvent::Close) | None => {
                return Err(TransportError::NotConnected.into());
            }
        }
    }
}

async fn query_ws(config: &TimeSyncConfig, wait: Duration) -> Result<Vec<u8>, TimeSyncError> {
    let url = config.url.as_deref().ok_or(TimeSyncError::MissingUrl)?;
    let (ws, mut rx) = WebSocketClient::new(WebSocketClientConfig {
        local_ip: config.local_ip,
        connect_timeout: wait,
        disable_watchdog: true,
        max_connect_attempts: 1,
        event_capacity: 16,
        ..Default::default()
    });
    let result = tokio::time::timeout(wait, exchange_ws(&ws, &mut rx, url)).await;
    ws.dispose().await;
    result.map_err(|_| TimeSyncError::Timeout(wait))?
}

async fn exchange_ws(
    ws: &WebSocketClient,
    rx: &mut mpsc::Receiver<WsEvent>,
    url: &str,
) -> Result<Vec<u8>, TimeSyncError> {
    ws.connect(url).await?;
    loop {
        match rx.recv().await {
            Some(WsEvent::Open) => ws.send_binary(ntp::client_request().to_vec()).await?,
            Some(WsEvent::Message(WsMessage::Binary(data))) if data.len() >= NTP_PACKET_SIZE => {
                return Ok(data[..NTP_PACKET_SIZE].to_vec());
            }
            Some(WsEvent::Message(_)) => {}
            Some(WsEvent::Error { message, .. }) => {
                return Err(TransportError::Protocol(message).into());
            }
            Some(WsEvent::Close) | None => return Err(TransportError::NotConnected.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::Ipv4Addr;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap()
    }

    /// One-shot NTP responder on a plain std socket.
    fn fake_ntp_server(reply_time: DateTime<Utc>) -> std::net::SocketAddr {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            if let Ok((len, from)) = socket.recv_from(&mut buf) {
                assert!(ntp::is_client_request(&buf[..len]));
                socket.send_to(&ntp::server_reply(reply_time), from).unwrap();
            }
        });
        addr
    }

    fn udp_config(port: u16) -> TimeSyncConfig {
        TimeSyncConfig {
            server: "127.0.0.1".into(),
            port,
            local_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            attempt_timeout: Duration::from_millis(300),
            resync_interval: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_udp_sync_sets_clock() {
        let server = fake_ntp_server(fixed_time());
        let (service, mut events) = TimeSyncService::start(udp_config(server.port()));

        let utc = service.sync_now().await.unwrap();
        assert_eq!(utc, fixed_time());
        assert!(service.is_synced());
        assert!(service.now() >= fixed_time());
        assert!(service.now() < fixed_time() + TimeDelta::seconds(5));

        match events.recv().await.unwrap() {
            TimeSyncEvent::Synced { utc, offset } => {
                assert_eq!(utc, fixed_time());
                assert!(offset < TimeDelta::zero());
            }
            other => panic!("Expected Synced, got {:?}", other),
        }
        service.dispose().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut config = udp_config(silent.local_addr().unwrap().port());
        config.attempts = 2;
        config.attempt_timeout = Duration::from_millis(100);
        let (service, mut events) = TimeSyncService::start(config);

        match service.sync_now().await {
            Err(TimeSyncError::Exhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert!(!service.is_synced());
        match events.recv().await.unwrap() {
            TimeSyncEvent::Error { code, .. } => assert_eq!(code, CODE_TIMEOUT),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_websocket_without_url() {
        let config = TimeSyncConfig {
            transport: TimeSyncTransport::WebSocket,
            resync_interval: None,
            ..Default::default()
        };
        let (service, _events) = TimeSyncService::start(config);
        match service.sync_now().await {
            Err(TimeSyncError::Exhausted { last, .. }) => assert!(last.contains("url")),
            other => panic!("Expected Exhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_transport_names() {
        let parsed: TimeSyncTransport = serde_json::from_str("\"websocket\"").unwrap();
        assert_eq!(parsed, TimeSyncTransport::WebSocket);
        assert_eq!(serde_json::to_string(&TimeSyncTransport::Tcp).unwrap(), "\"tcp\"");
    }
}
