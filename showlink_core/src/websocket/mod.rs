//! RFC 6455 WebSocket layer built on the TCP primitives.

pub mod client;
pub mod frame;
pub mod handshake;
pub mod server;
pub mod session;

pub use client::{ClientState, WebSocketClient, WebSocketClientConfig};
pub use frame::{Frame, FrameError, OpCode};
pub use handshake::{HandshakeError, compute_accept_key};
pub use server::{WebSocketServer, WebSocketServerConfig, WsServerEvent};
pub use session::{Role, SessionError, WsMessage, WsSession};

/// Events reported by a [`WebSocketClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    Open,
    Message(WsMessage),
    Error { code: i32, message: String },
    Close,
}
