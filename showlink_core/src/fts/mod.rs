//! FTS: chunked file transfer over UDP with device discovery.

pub mod bitmap;
pub mod devices;
pub mod protocol;
pub mod resource;
pub mod service;
pub mod storage;
pub mod transfer;

pub use bitmap::ChunkBitmap;
pub use devices::{DeviceRegistry, RemoteDevice};
pub use protocol::{ChunkAck, DenyReason, FtsMessage};
pub use resource::{FileResource, ResourceCache};
pub use service::{FileTransferService, FtsConfig, FtsEvent};
pub use storage::ChunkStorage;
pub use transfer::{FileRequest, FileUpload, TransferStatus};

use crate::error::{CODE_PROTOCOL, TransportError};
use resource::ResourceError;
use thiserror::Error;

pub const MAX_FILE_NAME_LEN: usize = 255;
const FALLBACK_FILE_NAME: &str = "unknown_file";

#[derive(Debug, Error)]
pub enum FtsError {
    #[error("Invalid file name {0:?}")]
    InvalidFileName(String),

    #[error("Transfer denied: {0}")]
    Denied(DenyReason),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("File transfer service is disposed")]
    Disposed,
}

impl FtsError {
    pub fn code(&self) -> i32 {
        match self {
            FtsError::Denied(reason) => reason.code(),
            FtsError::Resource(ResourceError::TooLarge { .. }) => DenyReason::TooLarge.code(),
            FtsError::Resource(ResourceError::NotFound(_) | ResourceError::InvalidPath(_)) => {
                DenyReason::NotFound.code()
            }
            FtsError::Resource(ResourceError::Io(e)) => e.raw_os_error().unwrap_or(-1),
            FtsError::Transport(e) => e.code(),
            FtsError::InvalidFileName(_) | FtsError::Disposed => CODE_PROTOCOL,
        }
    }
}

/// Reduce a remote-supplied name to a single safe path component.
pub fn sanitize_file_name(file_name: &str) -> String {
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut clean: String = last.chars().filter(|c| !c.is_control()).collect();

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if clean.trim().is_empty()
        || clean == "."
        || clean == ".."
        || RESERVED.iter().any(|r| clean.eq_ignore_ascii_case(r))
    {
        return FALLBACK_FILE_NAME.to_string();
    }

    if clean.len() > MAX_FILE_NAME_LEN {
        let ext = clean
            .rfind('.')
            .map(|idx| clean[idx..].to_string())
            .filter(|ext| ext.len() < 20)
            .unwrap_or_default();
        let mut cutoff = MAX_FILE_NAME_LEN - ext.len();
        while !clean.is_char_boundary(cutoff) {
            cutoff -= 1;
        }
        clean.truncate(cutoff);
        clean.push_str(&ext);
    }
    clean
}
