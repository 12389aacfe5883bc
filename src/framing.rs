//! Wire framing for the socket protocol.
//!
//! Messages are self-delimiting JSON documents written back to back:
//!
//! ```text
//! {"type":"echo","payload":"hello"}\n{"type":"echo","payload":"again"}\n
//! ```
//!
//! There is no length prefix. [`MessageDecoder`] scans incoming bytes for the
//! end of each top-level object (tracking nesting and string escapes) and only
//! then hands the complete document to `serde_json`.
//!
//! [`LimitedReader`] sits between the socket and the decoder and caps the total
//! number of bytes a connection may deliver.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{Error, Result};
use crate::message::Envelope;

/// Marker error carried inside the `io::Error` returned by [`LimitedReader`].
#[derive(Debug, thiserror::Error)]
#[error("message size exceeds limit of {limit} bytes")]
pub struct SizeLimitExceeded {
    /// Configured limit.
    pub limit: u64,
}

/// An [`AsyncRead`] adapter that fails once more than `limit` bytes have been
/// read in total.
///
/// The read that crosses the limit still fills the caller's buffer but returns
/// an error, as does every later read. There is no reset: once tripped, the
/// stream must be abandoned.
#[derive(Debug)]
pub struct LimitedReader<R> {
    inner: R,
    limit: u64,
    consumed: u64,
}

impl<R> LimitedReader<R> {
    /// Wrap `inner`, allowing at most `limit` bytes in total.
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            limit,
            consumed: 0,
        }
    }

    /// Total bytes delivered so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Whether the limit has been exceeded.
    pub fn is_exhausted(&self) -> bool {
        self.consumed > self.limit
    }

    fn limit_error(&self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, SizeLimitExceeded { limit: self.limit })
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.is_exhausted() {
            return Poll::Ready(Err(self.limit_error()));
        }

        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                this.consumed = this.consumed.saturating_add(n as u64);
                if this.is_exhausted() {
                    Poll::Ready(Err(this.limit_error()))
                } else {
                    Poll::Ready(Ok(()))
                }
            }
            other => other,
        }
    }
}

/// Map a read error from the socket stack into the crate error, recognizing
/// the size-limit marker.
pub(crate) fn classify_read_error(err: io::Error) -> Error {
    if let Some(limit) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<SizeLimitExceeded>())
        .map(|e| e.limit)
    {
        return Error::MessageTooLarge { limit };
    }
    Error::Io(err)
}

/// Tracks JSON nesting across feeds to find where a top-level document ends.
#[derive(Debug, Default, Clone, Copy)]
struct DocumentScanner {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl DocumentScanner {
    /// Scan `bytes`, returning the offset one past the closing brace of the
    /// current document if it ends within them.
    fn advance(&mut self, bytes: &[u8]) -> Result<Option<usize>> {
        for (i, &b) in bytes.iter().enumerate() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            if self.depth == 0 {
                match b {
                    b' ' | b'\t' | b'\r' | b'\n' => continue,
                    b'{' => {
                        self.depth = 1;
                        continue;
                    }
                    other => {
                        return Err(Error::Malformed(format!(
                            "expected '{{' at start of message, found {:?}",
                            char::from(other)
                        )));
                    }
                }
            }

            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Ok(Some(i + 1));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }
}

/// Incremental decoder that turns a byte stream into [`Envelope`]s.
///
/// Append bytes with [`push`](MessageDecoder::push) and pull complete
/// messages one at a time with [`next_message`](MessageDecoder::next_message).
/// Partial documents stay buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
    /// Start of the first undecoded byte in `buf`.
    start: usize,
    /// Bytes of `buf` already seen by `scanner`.
    scanned: usize,
    scanner: DocumentScanner,
}

impl MessageDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete message, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the next document is not a JSON object
    /// or does not have the envelope shape. Messages returned before the error
    /// are unaffected; the decoder should be discarded afterwards.
    pub fn next_message(&mut self) -> Result<Option<Envelope>> {
        let Some(len) = self.scanner.advance(&self.buf[self.scanned..])? else {
            self.scanned = self.buf.len();
            return Ok(None);
        };

        let end = self.scanned + len;
        let envelope: Envelope = serde_json::from_slice(&self.buf[self.start..end])
            .map_err(|e| Error::Malformed(e.to_string()))?;
        self.start = end;
        self.scanned = end;
        self.scanner = DocumentScanner::default();
        Ok(Some(envelope))
    }

    /// Push `bytes` and collect every complete message.
    ///
    /// Stops at the first malformed document; use
    /// [`next_message`](Self::next_message) to keep the messages before it.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Envelope>> {
        self.push(bytes);
        let mut messages = Vec::new();
        while let Some(envelope) = self.next_message()? {
            messages.push(envelope);
        }
        Ok(messages)
    }

    /// Returns true if a message has started but not finished.
    pub fn has_partial(&self) -> bool {
        self.buf[self.start..].iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Number of buffered bytes belonging to an unfinished message.
    pub fn pending_len(&self) -> usize {
        self.buf.len() - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn wire(kind: &str, payload: &serde_json::Value) -> Vec<u8> {
        Envelope::new(kind, payload).unwrap().to_wire().unwrap()
    }

    #[test]
    fn test_single_message() {
        let mut decoder = MessageDecoder::new();
        let msgs = decoder.feed(&wire("echo", &serde_json::json!("hello"))).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), "echo");
        assert_eq!(msgs[0].decode_payload::<String>().unwrap(), "hello");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_multiple_messages_in_single_feed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&wire("a", &serde_json::json!(1)));
        buf.extend_from_slice(&wire("b", &serde_json::json!({"k": [1, 2]})));
        // Documents do not need a separator
        buf.extend_from_slice(br#"{"type":"c","payload":null}{"type":"d","payload":true}"#);

        let mut decoder = MessageDecoder::new();
        let msgs = decoder.feed(&buf).unwrap();
        let kinds: Vec<&str> = msgs.iter().map(Envelope::kind).collect();
        assert_eq!(kinds, ["a", "b", "c", "d"]);
    }

    #[test]
    fn test_partial_message_reassembly() {
        let encoded = wire("chat", &serde_json::json!({"username": "ada", "message": "hi"}));
        let mid = encoded.len() / 2;

        let mut decoder = MessageDecoder::new();
        assert!(decoder.feed(&encoded[..mid]).unwrap().is_empty());
        assert!(decoder.has_partial());

        let msgs = decoder.feed(&encoded[mid..]).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), "chat");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_byte_at_a_time() {
        let encoded = wire("x", &serde_json::json!({"deep": {"deeper": ["}", "{"]}}));
        let mut decoder = MessageDecoder::new();
        let mut total = Vec::new();
        for byte in &encoded {
            total.extend(decoder.feed(&[*byte]).unwrap());
        }
        assert_eq!(total.len(), 1);
        let payload: serde_json::Value = total[0].decode_payload().unwrap();
        assert_eq!(payload["deep"]["deeper"][0], "}");
    }

    #[test]
    fn test_braces_and_escapes_inside_strings() {
        let raw = br#"{"type":"s","payload":"a \"quoted\" } { \\"}"#;
        let mut decoder = MessageDecoder::new();
        let msgs = decoder.feed(raw).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].decode_payload::<String>().unwrap(), r#"a "quoted" } { \"#);
    }

    #[test]
    fn test_whitespace_between_documents_is_not_partial() {
        let mut decoder = MessageDecoder::new();
        let msgs = decoder.feed(b"  \n{\"type\":\"a\",\"payload\":1}\n\n").unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_non_object_rejected() {
        let mut decoder = MessageDecoder::new();
        assert!(matches!(decoder.feed(b"\"hello\""), Err(Error::Malformed(_))));

        let mut decoder = MessageDecoder::new();
        assert!(matches!(decoder.feed(b"[1,2]"), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_messages_before_malformed_document_survive() {
        let mut decoder = MessageDecoder::new();
        decoder.push(br#"{"type":"a","payload":1}{"type": nope}"#);

        let first = decoder.next_message().unwrap().unwrap();
        assert_eq!(first.kind(), "a");
        assert!(matches!(decoder.next_message(), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_next_message_waits_for_more_bytes() {
        let mut decoder = MessageDecoder::new();
        decoder.push(br#"{"type":"a","payload":1}{"type":"#);
        assert_eq!(decoder.next_message().unwrap().unwrap().kind(), "a");
        assert!(decoder.next_message().unwrap().is_none());
        assert!(decoder.has_partial());

        decoder.push(br#""b"}"#);
        assert_eq!(decoder.next_message().unwrap().unwrap().kind(), "b");
        assert!(!decoder.has_partial());
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_object_without_type_rejected() {
        let mut decoder = MessageDecoder::new();
        let result = decoder.feed(br#"{"payload": 1}"#);
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[test]
    fn test_invalid_json_inside_object_rejected() {
        let mut decoder = MessageDecoder::new();
        let result = decoder.feed(br#"{"type": nope}"#);
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[tokio::test]
    async fn test_limited_reader_passes_small_reads() {
        let data = b"0123456789";
        let mut reader = LimitedReader::new(&data[..], 10);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.consumed(), 10);
        assert!(!reader.is_exhausted());
    }

    #[tokio::test]
    async fn test_limited_reader_rejects_oversized_read() {
        let data = [b'a'; 20];
        let mut reader = LimitedReader::new(&data[..], 15);
        let mut buf = [0u8; 20];

        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(classify_read_error(err), Error::MessageTooLarge { limit: 15 }));

        // Stays failed on every later read
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(classify_read_error(err), Error::MessageTooLarge { limit: 15 }));
    }

    #[tokio::test]
    async fn test_limit_is_cumulative_across_reads() {
        let data = [b'a'; 12];
        let mut reader = LimitedReader::new(&data[..], 10);
        let mut buf = [0u8; 6];

        assert_eq!(reader.read(&mut buf).await.unwrap(), 6);
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(reader.consumed(), 12);
    }

    #[test]
    fn test_other_io_errors_pass_through() {
        let err = classify_read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::ConnectionReset));
    }
}
