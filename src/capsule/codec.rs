//! JSON framing over capsule stdio.
//!
//! Inbound messages are self-delimiting JSON values: the decoder accepts
//! newline-delimited output as well as values written back to back, and
//! buffers a partial value until the rest of it arrives. Outbound messages
//! are written one JSON object per line.

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes requested from the reader per fill.
const READ_CHUNK: usize = 8 * 1024;

/// Errors that end a decode stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read capsule stdout: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON from capsule: {0}")]
    Syntax(#[from] serde_json::Error),

    /// The stream ended in the middle of a value.
    #[error("capsule stdout closed with {pending} bytes of an incomplete message")]
    Truncated { pending: usize },
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// Streaming decoder yielding one JSON value at a time from an async reader.
pub struct JsonStreamDecoder<R> {
    reader: R,
    buffer: Vec<u8>,
    scan: BoundaryScan,
}

impl<R: AsyncRead + Unpin> JsonStreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(READ_CHUNK),
            scan: BoundaryScan::default(),
        }
    }

    /// Decode the next value.
    ///
    /// Returns `Ok(None)` on a clean end of stream. Any syntax error is
    /// terminal: the decoder does not try to resynchronise.
    pub async fn next_value(&mut self) -> Result<Option<serde_json::Value>, DecodeError> {
        loop {
            let leading = self
                .buffer
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buffer.drain(..leading);

            if !self.buffer.is_empty() {
                if let Some(decoded) = self.try_decode()? {
                    return Ok(Some(decoded));
                }
            }

            self.buffer.reserve(READ_CHUNK);
            let read = self.reader.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(DecodeError::Truncated {
                        pending: self.buffer.len(),
                    })
                };
            }
        }
    }

    /// Try to take one complete value off the front of the buffer.
    ///
    /// Objects, arrays and strings are parsed once their closing byte has
    /// been seen. Bare scalars go straight to the parser.
    fn try_decode(&mut self) -> Result<Option<serde_json::Value>, DecodeError> {
        if matches!(self.buffer[0], b'{' | b'[' | b'"') {
            let Some(end) = self.scan.advance(&self.buffer) else {
                return Ok(None);
            };
            let value = serde_json::from_slice(&self.buffer[..end])?;
            self.buffer.drain(..end);
            return Ok(Some(value));
        }

        let (value, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<serde_json::Value>();
            match stream.next() {
                Some(Ok(value)) => (value, stream.byte_offset()),
                Some(Err(e)) if e.is_eof() => return Ok(None),
                Some(Err(e)) => return Err(DecodeError::Syntax(e)),
                None => return Ok(None),
            }
        };

        self.buffer.drain(..consumed);
        Ok(Some(value))
    }
}

/// Finds where a JSON container or string ends without parsing it.
///
/// The position is kept between reads, so each buffered byte is looked at
/// once no matter how many reads a large value takes to arrive.
#[derive(Debug, Default)]
struct BoundaryScan {
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl BoundaryScan {
    /// Offset just past the value that starts at `buf[0]`, once it is complete.
    fn advance(&mut self, buf: &[u8]) -> Option<usize> {
        while self.scanned < buf.len() {
            let byte = buf[self.scanned];
            self.scanned += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return Some(self.finish());
                    }
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.finish());
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn finish(&mut self) -> usize {
        let end = self.scanned;
        *self = Self::default();
        end
    }
}

// ─── Encoder ─────────────────────────────────────────────────────────────────

/// Serialize a message as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
