//! Streaming JSON splitter for the subscription wire protocol.
//!
//! The server pushes back-to-back JSON objects with no length prefix, so the
//! splitter tracks object nesting itself: a state machine over braces,
//! strings and escapes that knows exactly where each top-level object ends.
//! Accumulation uses `bytes::BytesMut`; complete objects are sliced out
//! without copying and handed to serde.
//!
//! The splitter is pull-based: nothing is read from the socket unless a
//! consumer is awaiting the next message, which is all the read-side
//! backpressure this protocol needs.
//!
//! # Example
//!
//! ```
//! use docwire_client::protocol::JsonMessageStream;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let wire: &[u8] = br#"{"a":1} {"b":2}"#;
//! let mut stream = JsonMessageStream::new(wire);
//!
//! let first: serde_json::Value = stream.read().await.unwrap();
//! assert_eq!(first["a"], 1);
//! let second: serde_json::Value = stream.read().await.unwrap();
//! assert_eq!(second["b"], 2);
//! # }
//! ```

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, SubscriptionError};

/// Hard cap on a single wire message. A frame that grows past this is a
/// protocol violation, not a larger buffer.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Incremental scanner position inside the unconsumed buffer.
#[derive(Debug, Default)]
struct Scanner {
    /// Next unexamined byte.
    pos: usize,
    /// Byte index of the current object's opening brace.
    start: usize,
    /// Open-brace depth; 0 means between objects.
    depth: u32,
    in_string: bool,
    escaped: bool,
    /// Whether the opening brace of the current object has been seen.
    started: bool,
}

/// Splits a byte stream into top-level JSON objects and deserializes them.
pub struct JsonMessageStream<R> {
    reader: R,
    buf: BytesMut,
    scan: Scanner,
}

impl<R: AsyncRead + Unpin> JsonMessageStream<R> {
    /// Wrap a readable stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(64 * 1024),
            scan: Scanner::default(),
        }
    }

    /// Read until one complete top-level object is available.
    ///
    /// Returns `Ok(None)` on a clean end of stream (no partial object
    /// buffered). A stream that ends mid-object is a protocol violation.
    pub async fn next_object(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(obj) = self.try_extract()? {
                return Ok(Some(obj));
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.scan.started {
                    return Err(SubscriptionError::ProtocolViolation(
                        "stream ended inside a JSON object".to_string(),
                    ));
                }
                return Ok(None);
            }
        }
    }

    /// Read and deserialize the next object.
    ///
    /// End of stream maps to [`SubscriptionError::ConnectionTerminated`];
    /// the worker decides whether that is an error or a disposal.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<T> {
        match self.next_object().await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(SubscriptionError::ConnectionTerminated),
        }
    }

    /// Scan forward from the saved position; extract one object if complete.
    fn try_extract(&mut self) -> Result<Option<Bytes>> {
        while self.scan.pos < self.buf.len() {
            let byte = self.buf[self.scan.pos];

            if !self.scan.started {
                if byte.is_ascii_whitespace() {
                    self.scan.pos += 1;
                    continue;
                }
                if byte != b'{' {
                    return Err(SubscriptionError::ProtocolViolation(format!(
                        "expected start of JSON object, got byte 0x{byte:02x}"
                    )));
                }
                self.scan.started = true;
                self.scan.start = self.scan.pos;
                self.scan.depth = 1;
                self.scan.pos += 1;
                continue;
            }

            if self.scan.in_string {
                match byte {
                    _ if self.scan.escaped => self.scan.escaped = false,
                    b'\\' => self.scan.escaped = true,
                    b'"' => self.scan.in_string = false,
                    _ => {}
                }
            } else {
                match byte {
                    b'"' => self.scan.in_string = true,
                    b'{' => self.scan.depth += 1,
                    b'}' => {
                        self.scan.depth -= 1;
                        if self.scan.depth == 0 {
                            let end = self.scan.pos + 1;
                            let start = self.scan.start;
                            let raw = self.buf.split_to(end).freeze().slice(start..);
                            self.scan = Scanner::default();
                            return Ok(Some(raw));
                        }
                    }
                    _ => {}
                }
            }
            self.scan.pos += 1;

            if self.scan.pos - self.scan.start > MAX_MESSAGE_SIZE {
                return Err(SubscriptionError::ProtocolViolation(format!(
                    "message exceeds maximum size of {MAX_MESSAGE_SIZE} bytes"
                )));
            }
        }
        Ok(None)
    }
}
