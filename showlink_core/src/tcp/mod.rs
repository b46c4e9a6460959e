//! TCP transport: framed connections and a pooled server.

pub mod connection;
pub mod framing;
pub mod server;

pub use connection::{
    ConnectionEvent, ConnectionId, ConnectionStatus, TcpConnection, TcpConnectionConfig,
};
pub use framing::{
    DEFAULT_DELIMITER, DEFAULT_MAX_MESSAGE_SIZE, DelimitedBuffer, Framing, MessageTooLarge,
};
pub use server::{ServerEvent, TcpServer, TcpServerConfig};
