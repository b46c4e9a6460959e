//! Socket transport core for synchronized showroom displays.
//!
//! TCP, UDP and WebSocket primitives with event channels, the FTS
//! file-transfer protocol over UDP, and NTP-based clock synchronization.

pub mod address;
pub mod config;
pub mod error;
pub mod fts;
pub mod tcp;
pub mod timesync;
pub mod udp;
pub mod watchdog;
pub mod websocket;

pub use config::NodeConfig;
pub use error::{Result, TransportError};
pub use fts::{FileTransferService, FtsConfig, FtsError, FtsEvent};
pub use tcp::{ConnectionEvent, ServerEvent, TcpConnection, TcpServer};
pub use timesync::{SyncedClock, TimeRelay, TimeSyncEvent, TimeSyncService};
pub use udp::{UdpConnection, UdpEvent};
pub use websocket::{WebSocketClient, WebSocketServer, WsEvent, WsMessage, WsServerEvent};
