//! HTTP/1.1 Upgrade handshake.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use thiserror::Error;

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WS_VERSION: &str = "13";

/// Upper bound on the size of a request or response head.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Handshake head exceeds 8192 bytes")]
    HeadTooLarge,

    #[error("Malformed HTTP head: {0}")]
    Malformed(String),

    #[error("Method {0} is not GET")]
    BadMethod(String),

    #[error("Missing or invalid header {0}")]
    BadHeader(&'static str),

    #[error("Unexpected status {0}")]
    BadStatus(u16),

    #[error("Sec-WebSocket-Accept does not match the key")]
    AcceptMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead {
    /// Request line or status line.
    pub start_line: String,
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }
}

/// Parse an HTTP head from the front of `buf`. Returns the head and its byte
/// length, or `None` while the terminating blank line has not arrived.
pub fn parse_head(buf: &[u8]) -> Result<Option<(HttpHead, usize)>, HandshakeError> {
    let end = match buf.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => pos + 4,
        None if buf.len() > MAX_HEAD_SIZE => return Err(HandshakeError::HeadTooLarge),
        None => return Ok(None),
    };
    if end > MAX_HEAD_SIZE {
        return Err(HandshakeError::HeadTooLarge);
    }

    let text = std::str::from_utf8(&buf[..end - 4])
        .map_err(|_| HandshakeError::Malformed("head is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| HandshakeError::Malformed("empty start line".into()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::Malformed(format!("bad header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some((HttpHead { start_line, headers }, end)))
}

/// `base64(SHA1(key + GUID))`.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    STANDARD.encode(nonce)
}

/// Check an upgrade request and return its `Sec-WebSocket-Key`.
pub fn validate_request(head: &HttpHead) -> Result<String, HandshakeError> {
    let mut parts = head.start_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    if method != "GET" {
        return Err(HandshakeError::BadMethod(method.to_string()));
    }
    if !head.header_has_token("Connection", "upgrade") {
        return Err(HandshakeError::BadHeader("Connection"));
    }
    if !head.header_has_token("Upgrade", "websocket") {
        return Err(HandshakeError::BadHeader("Upgrade"));
    }
    if head.header("Sec-WebSocket-Version") != Some(WS_VERSION) {
        return Err(HandshakeError::BadHeader("Sec-WebSocket-Version"));
    }
    match head.header("Sec-WebSocket-Key") {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => Err(HandshakeError::BadHeader("Sec-WebSocket-Key")),
    }
}

pub fn accept_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        compute_accept_key(key)
    )
}

pub fn bad_request_response(reason: &str) -> String {
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        reason.len(),
        reason
    )
}

pub fn client_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: {WS_VERSION}\r\n\r\n"
    )
}

/// Check the server's answer to a request sent with `key`.
pub fn validate_response(head: &HttpHead, key: &str) -> Result<(), HandshakeError> {
    let status = head
        .start_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| HandshakeError::Malformed(head.start_line.clone()))?;
    if status != 101 {
        return Err(HandshakeError::BadStatus(status));
    }
    if !head.header_has_token("Upgrade", "websocket") {
        return Err(HandshakeError::BadHeader("Upgrade"));
    }
    if head.header("Sec-WebSocket-Accept") != Some(compute_accept_key(key).as_str()) {
        return Err(HandshakeError::AcceptMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_accept_key_known_vector() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_parse_and_validate_request() {
        let mut bytes = SAMPLE_REQUEST.as_bytes().to_vec();
        bytes.extend_from_slice(b"\x81\x00");
        let (head, used) = parse_head(&bytes).unwrap().unwrap();
        assert_eq!(used, SAMPLE_REQUEST.len());
        assert_eq!(head.header("host"), Some("server.example.com"));
        assert_eq!(
            validate_request(&head).unwrap(),
            "dGhlIHNhbXBsZSBub25jZQ=="
        );

        assert_eq!(parse_head(&bytes[..20]).unwrap(), None);
    }

    #[test]
    fn test_invalid_requests() {
        let post = SAMPLE_REQUEST.replacen("GET", "POST", 1);
        let (head, _) = parse_head(post.as_bytes()).unwrap().unwrap();
        assert_eq!(
            validate_request(&head),
            Err(HandshakeError::BadMethod("POST".into()))
        );

        let old = SAMPLE_REQUEST.replace("Version: 13", "Version: 8");
        let (head, _) = parse_head(old.as_bytes()).unwrap().unwrap();
        assert_eq!(
            validate_request(&head),
            Err(HandshakeError::BadHeader("Sec-WebSocket-Version"))
        );

        let keyless = SAMPLE_REQUEST.replace("dGhlIHNhbXBsZSBub25jZQ==", "");
        let (head, _) = parse_head(keyless.as_bytes()).unwrap().unwrap();
        assert_eq!(
            validate_request(&head),
            Err(HandshakeError::BadHeader("Sec-WebSocket-Key"))
        );
    }

    #[test]
    fn test_client_round_trip() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);

        let request = client_request("localhost:9000", "/", &key);
        let (head, _) = parse_head(request.as_bytes()).unwrap().unwrap();
        let echoed = validate_request(&head).unwrap();

        let response = accept_response(&echoed);
        let (head, _) = parse_head(response.as_bytes()).unwrap().unwrap();
        assert_eq!(validate_response(&head, &key), Ok(()));
        assert_eq!(
            validate_response(&head, "other"),
            Err(HandshakeError::AcceptMismatch)
        );

        let rejected = bad_request_response("nope");
        let (head, _) = parse_head(rejected.as_bytes()).unwrap().unwrap();
        assert_eq!(
            validate_response(&head, &key),
            Err(HandshakeError::BadStatus(400))
        );
    }
}
