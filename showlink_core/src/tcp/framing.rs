//! Delimiter framing for TCP byte streams.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Default end-of-message marker.
pub const DEFAULT_DELIMITER: &[u8] = b"<EOF>";
/// Default cap on a single delimited message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Buffered data exceeded the message cap without a delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("message exceeds {limit} bytes without a delimiter")]
pub struct MessageTooLarge {
    pub limit: usize,
}

/// How a connection cuts its byte stream into messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Each message ends with the delimiter; empty messages are keep-alives.
    Delimited(Vec<u8>),
    /// Every read is delivered as-is (used below the WebSocket layer).
    Raw,
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Delimited(DEFAULT_DELIMITER.to_vec())
    }
}

impl Framing {
    /// Wrap an outgoing payload for the wire.
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        match self {
            Framing::Delimited(delimiter) => {
                let mut out = BytesMut::with_capacity(payload.len() + delimiter.len());
                out.extend_from_slice(payload);
                out.extend_from_slice(delimiter);
                out.freeze()
            }
            Framing::Raw => Bytes::copy_from_slice(payload),
        }
    }

    /// Wire form of a keep-alive, if the framing has one.
    pub fn keep_alive(&self) -> Option<Bytes> {
        match self {
            Framing::Delimited(delimiter) => Some(Bytes::copy_from_slice(delimiter)),
            Framing::Raw => None,
        }
    }
}

/// Accumulates stream reads and yields complete delimited messages.
///
/// Trailing partial data stays buffered for the next read.
#[derive(Debug)]
pub struct DelimitedBuffer {
    buf: BytesMut,
    delimiter: Vec<u8>,
    scanned: usize,
    max_message_size: usize,
}

impl DelimitedBuffer {
    pub fn new(delimiter: &[u8]) -> Self {
        Self::with_limit(delimiter, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_limit(delimiter: &[u8], max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            delimiter: delimiter.to_vec(),
            scanned: 0,
            max_message_size,
        }
    }

    /// Append `data` and return all messages it completed, in order.
    /// Empty messages (keep-alives) are included as empty `Bytes`.
    ///
    /// Fails once a message, or the unterminated tail, grows past the cap.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, MessageTooLarge> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        let dlen = self.delimiter.len();
        if dlen == 0 {
            if !self.buf.is_empty() {
                out.push(self.buf.split().freeze());
            }
            return Ok(out);
        }

        while let Some(pos) = find(&self.buf[self.scanned..], &self.delimiter) {
            let end = self.scanned + pos;
            if end > self.max_message_size {
                return Err(self.overflow());
            }
            let message = self.buf.split_to(end).freeze();
            let _ = self.buf.split_to(dlen);
            self.scanned = 0;
            out.push(message);
        }
        // Keep a delimiter-sized tail unscanned; it may complete with the next read.
        self.scanned = self.buf.len().saturating_sub(dlen - 1);
        if self.buf.len() > self.max_message_size.saturating_add(dlen) {
            return Err(self.overflow());
        }
        Ok(out)
    }

    fn overflow(&mut self) -> MessageTooLarge {
        self.clear();
        MessageTooLarge {
            limit: self.max_message_size,
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_message() {
        let mut buf = DelimitedBuffer::new(b"<EOF>");
        let msgs = buf.push(b"hello<EOF>").unwrap();
        assert_eq!(msgs, vec![Bytes::from_static(b"hello")]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_partial_then_complete() {
        let mut buf = DelimitedBuffer::new(b"<EOF>");
        assert!(buf.push(b"hel").unwrap().is_empty());
        assert!(buf.push(b"lo<E").unwrap().is_empty());
        let msgs = buf.push(b"OF>wor").unwrap();
        assert_eq!(msgs, vec![Bytes::from_static(b"hello")]);
        assert_eq!(buf.pending(), 3);
        let msgs = buf.push(b"ld<EOF>").unwrap();
        assert_eq!(msgs, vec![Bytes::from_static(b"world")]);
    }

    #[test]
    fn test_many_in_one_read_and_keep_alive() {
        let mut buf = DelimitedBuffer::new(b"\n");
        let msgs = buf.push(b"a\n\nbb\nc").unwrap();
        assert_eq!(
            msgs,
            vec![
                Bytes::from_static(b"a"),
                Bytes::new(),
                Bytes::from_static(b"bb")
            ]
        );
        assert_eq!(buf.pending(), 1);
    }

    #[test]
    fn test_unterminated_message_hits_cap() {
        let mut buf = DelimitedBuffer::with_limit(b"<EOF>", 8);
        assert_eq!(buf.push(b"12345678<EOF>").unwrap(), vec![Bytes::from_static(b"12345678")]);
        assert!(buf.push(b"1234").unwrap().is_empty());
        assert_eq!(buf.push(b"56789abcdef"), Err(MessageTooLarge { limit: 8 }));
        assert_eq!(buf.pending(), 0);

        // A complete but oversized message in one read is refused too.
        assert!(buf.push(b"0123456789<EOF>").is_err());
        assert_eq!(buf.push(b"ok<EOF>").unwrap(), vec![Bytes::from_static(b"ok")]);
    }

    #[test]
    fn test_framing_encode() {
        let framing = Framing::default();
        assert_eq!(&framing.encode(b"x")[..], b"x<EOF>");
        assert_eq!(framing.keep_alive().as_deref(), Some(&b"<EOF>"[..]));
        assert_eq!(&Framing::Raw.encode(b"x")[..], b"x");
        assert!(Framing::Raw.keep_alive().is_none());
    }
}
