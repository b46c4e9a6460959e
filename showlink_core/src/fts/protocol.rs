//! FTS wire format: ASCII headers separated by ';', binary tail on F4.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;
const SEPARATOR: u8 = b';';

/// Fixed bytes of an F4 header besides the file name: tag, five separators
/// and the widest numeric fields.
const CHUNK_HEADER_FIXED: usize = 2 + 6 + 10 + 10 + 10 + 20;

/// Reasons carried by an F2 denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    NotFound,
    NotAServer,
    TooLarge,
}

impl DenyReason {
    pub fn code(self) -> i32 {
        match self {
            DenyReason::NotFound => 0,
            DenyReason::NotAServer => 1,
            DenyReason::TooLarge => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DenyReason::NotFound),
            1 => Some(DenyReason::NotAServer),
            2 => Some(DenyReason::TooLarge),
            _ => None,
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DenyReason::NotFound => "file not found",
            DenyReason::NotAServer => "peer is not a file server",
            DenyReason::TooLarge => "file exceeds the size limit",
        };
        f.write_str(text)
    }
}

/// The `part` field of an F3 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAck {
    Part(u32),
    Complete,
    NeedsConfirmation,
    Rejected,
}

impl ChunkAck {
    pub fn wire(self) -> i64 {
        match self {
            ChunkAck::Part(part) => part as i64,
            ChunkAck::Complete => -1,
            ChunkAck::NeedsConfirmation => -2,
            ChunkAck::Rejected => -3,
        }
    }

    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            -1 => Some(ChunkAck::Complete),
            -2 => Some(ChunkAck::NeedsConfirmation),
            -3 => Some(ChunkAck::Rejected),
            v if (0..=u32::MAX as i64).contains(&v) => Some(ChunkAck::Part(v as u32)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub is_server: bool,
    pub name: String,
    pub protocol_version: u32,
    pub os: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtsMessage {
    /// F0: discovery query, carries the sender's own description.
    Discover(DeviceInfo),
    /// F1: discovery response.
    Announce(DeviceInfo),
    /// F2
    Denied { file: String, reason: DenyReason },
    /// F3: request for a chunk, or a completion/confirmation/rejection signal.
    ChunkRequest {
        file: String,
        ack: ChunkAck,
        chunk_size: u32,
    },
    /// F4
    Chunk {
        file: String,
        part: u32,
        chunk_size: u32,
        total_chunks: u32,
        file_size: u64,
        data: Bytes,
    },
    /// F5: unsolicited offer to push a file.
    PushOffer { file: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Datagram too short")]
    TooShort,

    #[error("Unknown header {0:?}")]
    UnknownHeader(String),

    #[error("Malformed {header} message: {reason}")]
    Malformed {
        header: &'static str,
        reason: String,
    },
}

/// File names travel between separators and must not contain one.
pub fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(';') && !name.contains('\0')
}

/// Largest chunk that fits a datagram of `io_buffer_size` for `file`.
pub fn max_chunk_size(io_buffer_size: usize, file: &str) -> usize {
    io_buffer_size.saturating_sub(CHUNK_HEADER_FIXED + file.len())
}

fn clean_field(value: &str) -> String {
    value.replace(';', ",")
}

impl FtsMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            FtsMessage::Discover(_) => "F0",
            FtsMessage::Announce(_) => "F1",
            FtsMessage::Denied { .. } => "F2",
            FtsMessage::ChunkRequest { .. } => "F3",
            FtsMessage::Chunk { .. } => "F4",
            FtsMessage::PushOffer { .. } => "F5",
        }
    }

    pub fn file(&self) -> Option<&str> {
        match self {
            FtsMessage::Discover(_) | FtsMessage::Announce(_) => None,
            FtsMessage::Denied { file, .. }
            | FtsMessage::ChunkRequest { file, .. }
            | FtsMessage::Chunk { file, .. }
            | FtsMessage::PushOffer { file } => Some(file),
        }
    }

    pub fn encode(&self) -> Bytes {
        let head = match self {
            FtsMessage::Discover(info) | FtsMessage::Announce(info) => format!(
                "{};{};{};{};{}",
                self.tag(),
                if info.is_server { 1 } else { 0 },
                clean_field(&info.name),
                info.protocol_version,
                clean_field(&info.os)
            ),
            FtsMessage::Denied { file, reason } => format!("F2;{};{}", file, reason.code()),
            FtsMessage::ChunkRequest {
                file,
                ack,
                chunk_size,
            } => format!("F3;{};{};{}", file, ack.wire(), chunk_size),
            FtsMessage::Chunk {
                file,
                part,
                chunk_size,
                total_chunks,
                file_size,
                data,
            } => {
                let head = format!(
                    "F4;{};{};{};{};{};",
                    file, part, chunk_size, total_chunks, file_size
                );
                let mut out = BytesMut::with_capacity(head.len() + data.len());
                out.put_slice(head.as_bytes());
                out.put_slice(data);
                return out.freeze();
            }
            FtsMessage::PushOffer { file } => format!("F5;{}", file),
        };
        Bytes::from(head)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < 2 {
            return Err(ProtocolError::TooShort);
        }
        if &datagram[..2] == b"F4" {
            return decode_chunk(datagram);
        }

        let text = std::str::from_utf8(datagram).map_err(|_| ProtocolError::Malformed {
            header: "FTS",
            reason: "not ASCII".into(),
        })?;
        let fields: Vec<&str> = text.split(';').collect();
        match fields[0] {
            "F0" | "F1" => {
                let header = if fields[0] == "F0" { "F0" } else { "F1" };
                let [_, is_server, name, version, os] = fields[..] else {
                    return Err(malformed(header, "expected 5 fields"));
                };
                let info = DeviceInfo {
                    is_server: parse_flag(is_server).ok_or_else(|| malformed(header, "isServer"))?,
                    name: name.to_string(),
                    protocol_version: version
                        .trim()
                        .parse()
                        .map_err(|_| malformed(header, "version"))?,
                    os: os.to_string(),
                };
                Ok(if header == "F0" {
                    FtsMessage::Discover(info)
                } else {
                    FtsMessage::Announce(info)
                })
            }
            "F2" => {
                let [_, file, code] = fields[..] else {
                    return Err(malformed("F2", "expected 3 fields"));
                };
                let reason = code
                    .trim()
                    .parse()
                    .ok()
                    .and_then(DenyReason::from_code)
                    .ok_or_else(|| malformed("F2", "error code"))?;
                Ok(FtsMessage::Denied {
                    file: checked_name("F2", file)?,
                    reason,
                })
            }
            "F3" => {
                let [_, file, part, chunk_size] = fields[..] else {
                    return Err(malformed("F3", "expected 4 fields"));
                };
                let ack = part
                    .trim()
                    .parse()
                    .ok()
                    .and_then(ChunkAck::from_wire)
                    .ok_or_else(|| malformed("F3", "part"))?;
                Ok(FtsMessage::ChunkRequest {
                    file: checked_name("F3", file)?,
                    ack,
                    chunk_size: chunk_size
                        .trim()
                        .parse()
                        .map_err(|_| malformed("F3", "chunk size"))?,
                })
            }
            "F5" => {
                let [_, file] = fields[..] else {
                    return Err(malformed("F5", "expected 2 fields"));
                };
                Ok(FtsMessage::PushOffer {
                    file: checked_name("F5", file)?,
                })
            }
            other => Err(ProtocolError::UnknownHeader(other.to_string())),
        }
    }
}

fn malformed(header: &'static str, reason: &str) -> ProtocolError {
    ProtocolError::Malformed {
        header,
        reason: reason.to_string(),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn checked_name(header: &'static str, name: &str) -> Result<String, ProtocolError> {
    if is_valid_file_name(name) {
        Ok(name.to_string())
    } else {
        Err(malformed(header, "file name"))
    }
}

fn decode_chunk(datagram: &[u8]) -> Result<FtsMessage, ProtocolError> {
    // Binary payload starts after the sixth separator.
    let mut fields = Vec::with_capacity(6);
    let mut start = 0;
    for (i, byte) in datagram.iter().enumerate() {
        if *byte == SEPARATOR {
            fields.push(&datagram[start..i]);
            start = i + 1;
            if fields.len() == 6 {
                break;
            }
        }
    }
    if fields.len() < 6 {
        return Err(malformed("F4", "header incomplete"));
    }

    let text = |raw: &[u8]| std::str::from_utf8(raw).map(str::to_string).ok();
    let number = |raw: &[u8], what: &str| -> Result<u64, ProtocolError> {
        text(raw)
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| malformed("F4", what))
    };

    let file = text(fields[1]).ok_or_else(|| malformed("F4", "file name"))?;
    let part = number(fields[2], "part")?;
    let chunk_size = number(fields[3], "chunk size")?;
    let total_chunks = number(fields[4], "total chunks")?;
    let file_size = number(fields[5], "file size")?;
    let as_u32 = |v: u64, what: &str| u32::try_from(v).map_err(|_| malformed("F4", what));

    Ok(FtsMessage::Chunk {
        file: checked_name("F4", &file)?,
        part: as_u32(part, "part")?,
        chunk_size: as_u32(chunk_size, "chunk size")?,
        total_chunks: as_u32(total_chunks, "total chunks")?,
        file_size,
        data: Bytes::copy_from_slice(&datagram[start..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_messages() {
        let info = DeviceInfo {
            is_server: true,
            name: "Lobby;Wall".into(),
            protocol_version: PROTOCOL_VERSION,
            os: "linux".into(),
        };
        let wire = FtsMessage::Announce(info.clone()).encode();
        assert_eq!(&wire[..], b"F1;1;Lobby,Wall;1;linux");

        match FtsMessage::decode(&wire).unwrap() {
            FtsMessage::Announce(decoded) => {
                assert!(decoded.is_server);
                assert_eq!(decoded.name, "Lobby,Wall");
                assert_eq!(decoded.os, "linux");
            }
            other => panic!("Expected Announce, got {:?}", other),
        }

        // Peers may send the flag as a word.
        match FtsMessage::decode(b"F0;false;Kiosk;1;windows").unwrap() {
            FtsMessage::Discover(info) => assert!(!info.is_server),
            other => panic!("Expected Discover, got {:?}", other),
        }
    }

    #[test]
    fn test_chunk_payload_may_contain_separators() {
        let data = Bytes::from_static(b"a;b;c\0\xff;");
        let message = FtsMessage::Chunk {
            file: "clip.mp4".into(),
            part: 2,
            chunk_size: 65000,
            total_chunks: 3,
            file_size: 150000,
            data: data.clone(),
        };
        let wire = message.encode();
        assert!(wire.starts_with(b"F4;clip.mp4;2;65000;3;150000;"));
        assert_eq!(FtsMessage::decode(&wire).unwrap(), message);
    }

    #[test]
    fn test_chunk_request_signals() {
        assert_eq!(
            FtsMessage::decode(b"F3;a.bin;-1;65000").unwrap(),
            FtsMessage::ChunkRequest {
                file: "a.bin".into(),
                ack: ChunkAck::Complete,
                chunk_size: 65000
            }
        );
        assert_eq!(ChunkAck::from_wire(-2), Some(ChunkAck::NeedsConfirmation));
        assert_eq!(ChunkAck::from_wire(-3), Some(ChunkAck::Rejected));
        assert_eq!(ChunkAck::from_wire(-4), None);
        assert_eq!(
            &FtsMessage::Denied {
                file: "big.bin".into(),
                reason: DenyReason::TooLarge
            }
            .encode()[..],
            b"F2;big.bin;2"
        );
    }

    #[test]
    fn test_malformed_messages() {
        assert_eq!(FtsMessage::decode(b"F"), Err(ProtocolError::TooShort));
        assert!(matches!(
            FtsMessage::decode(b"F9;x"),
            Err(ProtocolError::UnknownHeader(_))
        ));
        assert!(FtsMessage::decode(b"F3;a.bin;x;1").is_err());
        assert!(FtsMessage::decode(b"F4;a.bin;0;10").is_err());
        assert!(FtsMessage::decode(b"F5;").is_err());
    }

    #[test]
    fn test_max_chunk_size_leaves_room_for_header() {
        let size = max_chunk_size(65507, "sample.bin");
        let message = FtsMessage::Chunk {
            file: "sample.bin".into(),
            part: u32::MAX,
            chunk_size: u32::MAX,
            total_chunks: u32::MAX,
            file_size: u64::MAX,
            data: Bytes::from(vec![0u8; size]),
        };
        assert!(message.encode().len() <= 65507);
    }
}
