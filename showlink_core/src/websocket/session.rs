//! WebSocket protocol state for one upgraded stream, independent of I/O.
//!
//! `feed` turns received bytes into [`SessionOutput`]s; the owner writes any
//! replies and delivers messages. Encoding helpers apply the masking rule of
//! the session's role.

use crate::error::CODE_PROTOCOL;
use crate::websocket::frame::{self, Frame, FrameError, OpCode};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Close status for a normal shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Receives masked frames, sends unmasked ones.
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
}

impl WsMessage {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WsMessage::Text(text) => text.as_bytes(),
            WsMessage::Binary(data) => data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Message(WsMessage),
    /// Encoded frame to write back to the peer.
    Reply(Bytes),
    /// The peer closed the session.
    Closed { code: u16, reason: String },
    /// Traffic that only proves liveness (pong, empty message).
    Alive,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Client frame is not masked")]
    UnmaskedFrame,

    #[error("Server frame must not be masked")]
    MaskedFrame,

    #[error("Continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("New data frame while a fragmented message is in progress")]
    InterleavedMessage,

    #[error("Reassembled message exceeds {0} bytes")]
    MessageTooLarge(usize),

    #[error("Text message is not valid UTF-8")]
    InvalidUtf8,
}

impl SessionError {
    pub fn code(&self) -> i32 {
        CODE_PROTOCOL
    }
}

#[derive(Debug)]
pub struct WsSession {
    role: Role,
    buf: BytesMut,
    partial: Option<(OpCode, BytesMut)>,
    max_frame_size: usize,
    max_message_size: usize,
    close_sent: bool,
}

impl WsSession {
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            buf: BytesMut::new(),
            partial: None,
            max_frame_size,
            max_message_size: max_frame_size.saturating_mul(4),
            close_sent: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Consume received bytes. Incomplete frames stay buffered.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<SessionOutput>, SessionError> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some(frame) = frame::decode(&mut self.buf, self.max_frame_size)? {
            match (self.role, frame.mask.is_some()) {
                (Role::Server, false) => return Err(SessionError::UnmaskedFrame),
                (Role::Client, true) => return Err(SessionError::MaskedFrame),
                _ => {}
            }
            self.handle_frame(frame, &mut out)?;
        }
        Ok(out)
    }

    fn handle_frame(
        &mut self,
        frame: Frame,
        out: &mut Vec<SessionOutput>,
    ) -> Result<(), SessionError> {
        match frame.opcode {
            OpCode::Ping => out.push(SessionOutput::Reply(
                self.encode_control(OpCode::Pong, &frame.payload),
            )),
            OpCode::Pong => out.push(SessionOutput::Alive),
            OpCode::Close => {
                let (code, reason) =
                    frame::parse_close_payload(&frame.payload).unwrap_or((CLOSE_NORMAL, String::new()));
                if !self.close_sent {
                    self.close_sent = true;
                    out.push(SessionOutput::Reply(
                        self.encode_control(OpCode::Close, &frame::close_payload(code, "")),
                    ));
                }
                out.push(SessionOutput::Closed { code, reason });
            }
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(SessionError::InterleavedMessage);
                }
                if frame.fin {
                    out.push(Self::complete(frame.opcode, frame.payload)?);
                } else {
                    self.partial = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
            }
            OpCode::Continuation => {
                let (opcode, mut data) = self
                    .partial
                    .take()
                    .ok_or(SessionError::UnexpectedContinuation)?;
                if data.len() + frame.payload.len() > self.max_message_size {
                    return Err(SessionError::MessageTooLarge(self.max_message_size));
                }
                data.extend_from_slice(&frame.payload);
                if frame.fin {
                    out.push(Self::complete(opcode, data.freeze())?);
                } else {
                    self.partial = Some((opcode, data));
                }
            }
        }
        Ok(())
    }

    fn complete(opcode: OpCode, payload: Bytes) -> Result<SessionOutput, SessionError> {
        // Zero-length messages are liveness pings.
        if payload.is_empty() {
            return Ok(SessionOutput::Alive);
        }
        let message = if opcode == OpCode::Text {
            let text = String::from_utf8(payload.to_vec()).map_err(|_| SessionError::InvalidUtf8)?;
            WsMessage::Text(text)
        } else {
            WsMessage::Binary(payload)
        };
        Ok(SessionOutput::Message(message))
    }

    fn prepare(&self, frame: Frame) -> Bytes {
        match self.role {
            Role::Client => frame.with_mask(rand::random()).encode(),
            Role::Server => frame.encode(),
        }
    }

    pub fn encode_control(&self, opcode: OpCode, payload: &[u8]) -> Bytes {
        let len = payload.len().min(125);
        self.prepare(Frame::new(opcode, Bytes::copy_from_slice(&payload[..len])))
    }

    /// Encode a message as one buffer holding all its fragments, each at
    /// most `max_frame_size`, so a single write keeps them contiguous.
    pub fn encode_message(&self, message: &WsMessage) -> Bytes {
        let fragments = self.fragments(message);
        if fragments.len() == 1 {
            return fragments.into_iter().next().unwrap_or_default();
        }
        let mut wire = BytesMut::with_capacity(fragments.iter().map(Bytes::len).sum());
        for fragment in &fragments {
            wire.extend_from_slice(fragment);
        }
        wire.freeze()
    }

    /// Zero-length data frame used as a keep-alive.
    pub fn encode_keep_alive(&self) -> Bytes {
        self.prepare(Frame::new(OpCode::Binary, Bytes::new()))
    }

    pub fn encode_close(&mut self, code: u16, reason: &str) -> Bytes {
        self.close_sent = true;
        self.encode_control(OpCode::Close, &frame::close_payload(code, reason))
    }

    fn fragments(&self, message: &WsMessage) -> Vec<Bytes> {
        let (opcode, payload) = match message {
            WsMessage::Text(text) => (OpCode::Text, Bytes::copy_from_slice(text.as_bytes())),
            WsMessage::Binary(data) => (OpCode::Binary, data.clone()),
        };
        let step = self.max_frame_size.max(1);
        if payload.len() <= step {
            return vec![self.prepare(Frame::new(opcode, payload))];
        }

        let total = payload.len().div_ceil(step);
        (0..total)
            .map(|i| {
                let start = i * step;
                let end = (start + step).min(payload.len());
                let op = if i == 0 { opcode } else { OpCode::Continuation };
                let frame = Frame::new(op, payload.slice(start..end)).with_fin(i + 1 == total);
                self.prepare(frame)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::frame::DEFAULT_MAX_FRAME_SIZE;

    fn pair() -> (WsSession, WsSession) {
        (
            WsSession::new(Role::Client, DEFAULT_MAX_FRAME_SIZE),
            WsSession::new(Role::Server, DEFAULT_MAX_FRAME_SIZE),
        )
    }

    #[test]
    fn test_client_to_server_messages() {
        let (client, mut server) = pair();
        for len in [10usize, 200, 100_000] {
            let payload: Bytes = (0..len).map(|i| (i % 256) as u8).collect::<Vec<_>>().into();
            let wire = client.encode_message(&WsMessage::Binary(payload.clone()));
            let outputs = server.feed(&wire).unwrap();
            assert_eq!(
                outputs,
                vec![SessionOutput::Message(WsMessage::Binary(payload))]
            );
        }
    }

    #[test]
    fn test_unmasked_frame_is_rejected_by_server() {
        let (_, mut server) = pair();
        let wire = Frame::new(OpCode::Text, &b"hello"[..]).encode();
        let err = server.feed(&wire).unwrap_err();
        assert_eq!(err, SessionError::UnmaskedFrame);
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_masked_frame_is_rejected_by_client() {
        let (mut client, server) = pair();
        let wire = Frame::new(OpCode::Text, &b"hello"[..])
            .with_mask([9, 9, 9, 9])
            .encode();
        assert_eq!(client.feed(&wire), Err(SessionError::MaskedFrame));
        // The server role never masks.
        let wire = server.encode_message(&WsMessage::Text("hi".into()));
        assert_eq!(
            client.feed(&wire).unwrap(),
            vec![SessionOutput::Message(WsMessage::Text("hi".into()))]
        );
    }

    #[test]
    fn test_fragments_delivered_once() {
        let mut client = WsSession::new(Role::Client, 4);
        let (_, mut server) = pair();
        let wire = client.fragments(&WsMessage::Text("fragmented text".into()));
        assert_eq!(wire.len(), 4);

        let mut outputs = Vec::new();
        for frame in &wire[..3] {
            outputs.extend(server.feed(frame).unwrap());
        }
        assert!(outputs.is_empty());
        outputs.extend(server.feed(&wire[3]).unwrap());
        assert_eq!(
            outputs,
            vec![SessionOutput::Message(WsMessage::Text("fragmented text".into()))]
        );

        let close = client.encode_close(CLOSE_NORMAL, "done");
        let outputs = server.feed(&close).unwrap();
        assert!(matches!(outputs[0], SessionOutput::Reply(_)));
        assert_eq!(
            outputs[1],
            SessionOutput::Closed {
                code: CLOSE_NORMAL,
                reason: "done".into()
            }
        );
    }

    #[test]
    fn test_ping_and_empty_message() {
        let (client, mut server) = pair();
        let ping = client.encode_control(OpCode::Ping, b"p");
        let outputs = server.feed(&ping).unwrap();
        let SessionOutput::Reply(pong) = &outputs[0] else {
            panic!("Expected pong reply, got {:?}", outputs);
        };
        let mut buf = BytesMut::from(&pong[..]);
        let frame = frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Pong);
        assert_eq!(&frame.payload[..], b"p");

        let keep_alive = client.encode_keep_alive();
        assert_eq!(server.feed(&keep_alive).unwrap(), vec![SessionOutput::Alive]);
    }

    #[test]
    fn test_fragmented_message_is_one_contiguous_buffer() {
        let client = WsSession::new(Role::Client, 1000);
        let mut server = WsSession::new(Role::Server, 1000);
        let payload = Bytes::from(vec![7u8; 4500]);
        let message = WsMessage::Binary(payload.clone());

        let fragments = client.fragments(&message);
        assert_eq!(fragments.len(), 5);
        let wire = client.encode_message(&message);
        assert_eq!(wire.len(), fragments.iter().map(Bytes::len).sum::<usize>());

        // Two messages back to back decode in order, never interleaved.
        let mut stream = BytesMut::from(&wire[..]);
        stream.extend_from_slice(&client.encode_message(&WsMessage::Text("next".into())));
        assert_eq!(
            server.feed(&stream).unwrap(),
            vec![
                SessionOutput::Message(WsMessage::Binary(payload)),
                SessionOutput::Message(WsMessage::Text("next".into())),
            ]
        );
    }

    #[test]
    fn test_new_message_inside_fragmented_one_is_rejected() {
        let (client, mut server) = pair();
        let start = client.prepare(Frame::new(OpCode::Text, &b"part"[..]).with_fin(false));
        assert!(server.feed(&start).unwrap().is_empty());
        let other = client.prepare(Frame::new(OpCode::Binary, &b"other"[..]));
        assert_eq!(server.feed(&other), Err(SessionError::InterleavedMessage));
    }

    #[test]
    fn test_continuation_without_start_is_rejected() {
        let (client, mut server) = pair();
        let stray = client.prepare(Frame::new(OpCode::Continuation, &b"tail"[..]));
        let err = server.feed(&stray).unwrap_err();
        assert_eq!(err, SessionError::UnexpectedContinuation);
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_reassembly_above_limit_is_rejected() {
        let client = WsSession::new(Role::Client, 8);
        let mut server = WsSession::new(Role::Server, 8);
        // 8-byte frames, 32-byte message cap: the fifth fragment overflows.
        let wire = client.fragments(&WsMessage::Binary(Bytes::from(vec![1u8; 40])));
        assert_eq!(wire.len(), 5);
        for frame in &wire[..4] {
            assert!(server.feed(frame).unwrap().is_empty());
        }
        assert_eq!(server.feed(&wire[4]), Err(SessionError::MessageTooLarge(32)));
    }

    #[test]
    fn test_invalid_utf8_text_is_rejected() {
        let (client, mut server) = pair();
        let bad = client.prepare(Frame::new(OpCode::Text, Bytes::from_static(&[0xC3, 0x28])));
        assert_eq!(server.feed(&bad), Err(SessionError::InvalidUtf8));
    }
}
