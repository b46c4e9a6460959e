//! Error types shared by the transport primitives.
//!
//! Every error knows its numeric `code()`, which is what connection events
//! carry in `Error { code, message }`.

use std::time::Duration;
use thiserror::Error;

/// Code used for protocol violations (mirrors HTTP 400).
pub const CODE_PROTOCOL: i32 = 400;
/// Code used when an operation gives up waiting.
pub const CODE_TIMEOUT: i32 = 408;
/// Code used when no OS error number is available.
pub const CODE_UNKNOWN: i32 = -1;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not resolve host '{0}'")]
    Resolve(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("gave up after {attempts} connection attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: String },

    #[error("not connected")]
    NotConnected,

    #[error("connection was disposed")]
    Disposed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid url '{0}'")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn code(&self) -> i32 {
        match self {
            TransportError::Io(e) => e.raw_os_error().unwrap_or(CODE_UNKNOWN),
            TransportError::Timeout(_) | TransportError::AttemptsExhausted { .. } => CODE_TIMEOUT,
            TransportError::Protocol(_) | TransportError::InvalidUrl(_) => CODE_PROTOCOL,
            TransportError::Resolve(_) | TransportError::NotConnected | TransportError::Disposed => {
                CODE_UNKNOWN
            }
        }
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
