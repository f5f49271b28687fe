//! Content-Length message framing for JSON messages over byte streams.
//!
//! This module implements HTTP-style Content-Length framing, the same protocol
//! used by the Language Server Protocol (LSP). It gives reliable message
//! boundaries over the stdio pipes of a child process.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! Content-Type: application/json\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header names are case-insensitive and both CRLF and LF line endings are
//! accepted. Some peers skip the header block and write one bare JSON value
//! per line; a header line starting with `{` or `[` is taken as a complete
//! message.

use std::collections::BTreeMap;
use std::io::{BufRead, ErrorKind, Read, Write};

use serde::Serialize;

use super::error::TransportError;

/// Maximum message size (100MB) to prevent OOM from malicious/buggy peers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Content type advertised on every frame we write.
pub const CONTENT_TYPE_JSON: &str = "application/json";

type Result<T> = std::result::Result<T, TransportError>;

/// Header block of one frame. Keys are stored lower-cased, values trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: BTreeMap<String, String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.entries
            .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    /// Case-insensitive lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared body length. A missing header means no body.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Framing` if the value is not a non-negative
    /// integer or exceeds [`MAX_MESSAGE_SIZE`].
    pub fn content_length(&self) -> Result<usize> {
        let Some(value) = self.get("content-length") else {
            return Ok(0);
        };
        let size: usize = value.parse().map_err(|_| {
            TransportError::Framing(format!("Invalid Content-Length value: {}", value))
        })?;
        if size > MAX_MESSAGE_SIZE {
            return Err(TransportError::Framing(format!(
                "Message size {} exceeds maximum {} bytes",
                size, MAX_MESSAGE_SIZE
            )));
        }
        Ok(size)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
    }
}

/// Result of reading the start of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStart {
    /// A full header block; the body follows on the stream.
    Headers(HeaderMap),
    /// A bare JSON line; no header block and no body follow.
    BareJson(String),
}

/// Serialize `body` and prefix it with a header block.
///
/// The declared length is the exact UTF-8 byte length of the serialized body
/// and nothing follows the body.
pub fn encode<T: Serialize + ?Sized>(body: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(body)
        .map_err(|e| TransportError::Framing(format!("Failed to serialize body: {}", e)))?;
    Ok(frame_bytes(&json))
}

/// Prefix an already serialized body with a header block.
pub fn frame_bytes(body: &[u8]) -> Vec<u8> {
    let header = format!(
        "Content-Length: {}\r\nContent-Type: {}\r\n\r\n",
        body.len(),
        CONTENT_TYPE_JSON
    );
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Read one raw line, including its terminator. Returns `None` at end of stream.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    read_line_limited(reader, MAX_MESSAGE_SIZE)
}

/// Read one raw line of at most `limit` bytes before its terminator.
///
/// # Errors
///
/// Returns `TransportError::Framing` when `limit` bytes arrive without a
/// newline.
fn read_line_limited<R: BufRead>(reader: &mut R, limit: usize) -> Result<Option<String>> {
    let mut buf = Vec::new();
    // One extra byte for the terminator
    let mut bounded = reader.by_ref().take(limit as u64 + 1);
    loop {
        match bounded.read_until(b'\n', &mut buf) {
            Ok(0) if buf.is_empty() => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if buf.len() > limit && buf.last() != Some(&b'\n') {
        return Err(TransportError::Framing(format!(
            "Line exceeds maximum {} bytes",
            limit
        )));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

fn is_bare_json(line: &str) -> bool {
    line.starts_with('{') || line.starts_with('[')
}

/// Read a header block up to and including its terminating blank line.
///
/// Blank lines before the first header are skipped. Returns `Ok(None)` on a
/// clean end of stream before any header line.
///
/// # Errors
///
/// Returns `TransportError::Framing` if a header line has no colon or the
/// stream ends inside the block.
pub fn decode_header<R: BufRead>(reader: &mut R) -> Result<Option<FrameStart>> {
    let first = loop {
        match read_line(reader)? {
            None => return Ok(None),
            Some(line) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    break trimmed.to_string();
                }
            }
        }
    };
    decode_header_from(reader, &first).map(Some)
}

/// Finish a header block whose first non-blank line was already read.
///
/// A `{` or `[` line anywhere in the block is taken as a bare JSON message
/// and the header lines read before it are dropped.
pub fn decode_header_from<R: BufRead>(reader: &mut R, first_line: &str) -> Result<FrameStart> {
    let mut headers = HeaderMap::new();
    let mut line = first_line.trim().to_string();

    loop {
        if is_bare_json(&line) {
            return Ok(FrameStart::BareJson(line));
        }
        parse_header_line(&line, &mut headers)?;

        let next = read_line(reader)?.ok_or_else(|| {
            TransportError::Framing("Stream ended inside header block".to_string())
        })?;
        line = next.trim().to_string();
        // Empty line signals end of headers
        if line.is_empty() {
            return Ok(FrameStart::Headers(headers));
        }
    }
}

fn parse_header_line(line: &str, headers: &mut HeaderMap) -> Result<()> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| TransportError::Framing(format!("Malformed header line: {:?}", line)))?;
    headers.insert(key, value);
    Ok(())
}

/// Read exactly `length` bytes.
///
/// A single `read` may return fewer bytes than requested, so this loops until
/// the body is complete.
///
/// # Errors
///
/// Returns `TransportError::TruncatedStream` if the stream ends first.
pub fn read_body<R: Read>(reader: &mut R, length: usize) -> Result<Vec<u8>> {
    let mut body = vec![0u8; length];
    let mut received = 0;
    while received < length {
        match reader.read(&mut body[received..]) {
            Ok(0) => {
                return Err(TransportError::TruncatedStream {
                    expected: length,
                    received,
                })
            }
            Ok(n) => received += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(body)
}

/// Read the body announced by `headers` and decode it as UTF-8.
///
/// Returns an empty string when the frame declares no body.
///
/// # Errors
///
/// Returns `TransportError::InvalidBody` when the bytes are not UTF-8. The
/// whole body has been consumed by then, so the caller may keep reading.
pub fn read_frame_body<R: BufRead>(reader: &mut R, headers: &HeaderMap) -> Result<String> {
    let length = headers.content_length()?;
    if length == 0 {
        return Ok(String::new());
    }
    let body = read_body(reader, length)?;
    String::from_utf8(body)
        .map_err(|e| TransportError::InvalidBody(e.to_string()))
}

/// Read one complete message (framed or bare JSON line).
///
/// Returns `Ok(None)` at end of stream. A frame without a body yields an
/// empty string.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    match decode_header(reader)? {
        None => Ok(None),
        Some(FrameStart::BareJson(line)) => Ok(Some(line)),
        Some(FrameStart::Headers(headers)) => read_frame_body(reader, &headers).map(Some),
    }
}

/// Write a framed message and flush.
pub fn write_message<W: Write>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
    writer.write_all(&frame_bytes(body))?;
    writer.flush()
}

/// Decode a complete frame held in memory.
pub fn decode(bytes: &[u8]) -> Result<serde_json::Value> {
    let mut reader = bytes;
    let message = read_message(&mut reader)?
        .ok_or_else(|| TransportError::Framing("Empty input".to_string()))?;
    serde_json::from_str(&message)
        .map_err(|e| TransportError::Framing(format!("Body is not valid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::BufReader;

    /// Reader that hands out at most one byte per `read` call.
    struct Trickle<'a> {
        data: &'a [u8],
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.data.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[0];
            self.data = &self.data[1..];
            Ok(1)
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let bodies = [
            json!({"protocol": "2.0", "id": "1", "method": "ping", "params": {}}),
            json!([1, 2.5, null, "x"]),
            json!({"model": "6205-2RSH", "note": "Ünïcödé ✓ 軸受"}),
            json!("just a string"),
        ];
        for body in bodies {
            assert_eq!(decode(&encode(&body).unwrap()).unwrap(), body);
        }
    }

    #[test]
    fn test_encode_declares_exact_byte_length() {
        let body = json!({"text": "rodamiento ñ €"});
        let frame = encode(&body).unwrap();
        let serialized = serde_json::to_vec(&body).unwrap();

        let text = String::from_utf8(frame.clone()).unwrap();
        let (header, rest) = text.split_once("\r\n\r\n").unwrap();
        assert!(header.starts_with(&format!("Content-Length: {}\r\n", serialized.len())));
        assert!(header.contains("Content-Type: application/json"));
        assert_eq!(rest.as_bytes(), serialized.as_slice());
        // Multi-byte characters: byte length differs from char count
        assert!(serialized.len() > rest.chars().count());
    }

    #[test]
    fn test_one_byte_reads() {
        let body = json!({"pong": true, "padding": "x".repeat(300)});
        let frame = encode(&body).unwrap();
        let mut reader = BufReader::with_capacity(1, Trickle { data: &frame });

        let message = read_message(&mut reader).unwrap().unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&message).unwrap(), body);
        assert_eq!(read_message(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_read_body_loops_over_short_reads() {
        let data = b"0123456789";
        let mut reader = Trickle { data };
        assert_eq!(read_body(&mut reader, 10).unwrap(), data.to_vec());
    }

    #[test]
    fn test_truncated_body() {
        let raw = b"Content-Length: 20\r\n\r\n{\"short\":1}";
        let mut reader = &raw[..];
        match read_message(&mut reader) {
            Err(TransportError::TruncatedStream { expected, received }) => {
                assert_eq!(expected, 20);
                assert_eq!(received, 11);
            }
            other => panic!("Expected TruncatedStream, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_header_block() {
        let mut reader = &b"Content-Length: 5\r\n"[..];
        let err = read_message(&mut reader).unwrap_err();
        assert!(err.to_string().contains("inside header block"));
    }

    #[test]
    fn test_bare_json_line() {
        let mut reader = &b"{\"protocol\":\"2.0\",\"id\":\"1\",\"result\":{}}\n"[..];
        match decode_header(&mut reader).unwrap() {
            Some(FrameStart::BareJson(line)) => {
                assert_eq!(line, r#"{"protocol":"2.0","id":"1","result":{}}"#)
            }
            other => panic!("Expected BareJson, got {other:?}"),
        }
    }

    #[test]
    fn test_bare_json_line_inside_header_block() {
        let mut reader = &b"Content-Type: application/json\r\n{\"a\":1}\n"[..];
        assert_eq!(
            decode_header(&mut reader).unwrap(),
            Some(FrameStart::BareJson(r#"{"a":1}"#.to_string()))
        );
        assert_eq!(read_message(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_line_length_limit() {
        let mut reader = &b"0123456789abcdef\n"[..];
        let err = read_line_limited(&mut reader, 8).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum 8 bytes"), "{err}");

        let mut reader = &b"01234567\nnext\n"[..];
        assert_eq!(
            read_line_limited(&mut reader, 8).unwrap(),
            Some("01234567\n".to_string())
        );
        assert_eq!(
            read_line_limited(&mut reader, 8).unwrap(),
            Some("next\n".to_string())
        );

        // Final line without terminator, within the limit
        let mut reader = &b"tail"[..];
        assert_eq!(
            read_line_limited(&mut reader, 8).unwrap(),
            Some("tail".to_string())
        );
        assert_eq!(read_line_limited(&mut reader, 8).unwrap(), None);
    }

    #[test]
    fn test_invalid_utf8_body_keeps_stream_in_sync() {
        let mut raw = frame_bytes(&[0xff, 0xfe, b'{', b'}']);
        raw.extend(encode(&json!({"n": 2})).unwrap());
        let mut reader = raw.as_slice();

        let err = read_message(&mut reader).unwrap_err();
        assert!(matches!(err, TransportError::InvalidBody(_)), "{err:?}");
        assert!(err.is_recoverable());
        assert_eq!(read_message(&mut reader).unwrap().unwrap(), r#"{"n":2}"#);
    }

    #[test]
    fn test_lf_line_endings_and_case() {
        let body = r#"{"test":true}"#;
        let raw = format!(
            "content-length: {}\ncontent-type: application/json\n\n{}",
            body.len(),
            body
        );
        let mut reader = raw.as_bytes();
        assert_eq!(read_message(&mut reader).unwrap().unwrap(), body);
    }

    #[test]
    fn test_consecutive_messages() {
        let mut raw = encode(&json!({"n": 1})).unwrap();
        raw.extend_from_slice(b"{\"n\":2}\r\n");
        raw.extend(encode(&json!({"n": 3})).unwrap());
        let mut reader = raw.as_slice();

        let mut seen = Vec::new();
        while let Some(message) = read_message(&mut reader).unwrap() {
            seen.push(serde_json::from_str::<serde_json::Value>(&message).unwrap()["n"].clone());
        }
        assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_header_without_colon_is_framing_error() {
        let mut reader = &b"hello world\r\n\r\n"[..];
        assert!(matches!(
            decode_header(&mut reader),
            Err(TransportError::Framing(_))
        ));
    }

    #[test]
    fn test_invalid_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Length", " abc ");
        assert!(matches!(
            headers.content_length(),
            Err(TransportError::Framing(_))
        ));

        headers.insert("CONTENT-LENGTH", &(MAX_MESSAGE_SIZE + 1).to_string());
        let err = headers.content_length().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_missing_content_length_means_no_body() {
        let mut reader = &b"Content-Type: application/json\r\n\r\n"[..];
        assert_eq!(read_message(&mut reader).unwrap(), Some(String::new()));
    }

    #[test]
    fn test_header_map_accessors() {
        let mut headers = HeaderMap::new();
        assert!(headers.is_empty());
        headers.insert(" Content-Type ", " application/json ");
        assert_eq!(headers.content_type(), Some("application/json"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(headers.content_length().unwrap(), 0);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_clean_eof_returns_none() {
        let mut reader = &b"\r\n\r\n"[..];
        assert_eq!(decode_header(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_write_message() {
        let mut out = Vec::new();
        write_message(&mut out, br#"{"a":1}"#).unwrap();
        assert_eq!(
            out,
            b"Content-Length: 7\r\nContent-Type: application/json\r\n\r\n{\"a\":1}".to_vec()
        );
    }
}
