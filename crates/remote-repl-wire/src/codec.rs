//! Incremental bencode codec over byte streams.
//!
//! The encoding is self-delimiting (`i<int>e`, `<len>:<bytes>`, `l...e`,
//! `d...e`), so concatenated messages can be pulled off a live stream with no
//! outer length header. `decode` consumes at most one complete message per
//! call and returns `None` until enough bytes are buffered.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;
use crate::value::{Dict, Value};

/// Upper bound on a single encoded string, so a corrupt length prefix cannot
/// make the reader buffer unbounded input.
pub const MAX_STRING_LEN: usize = 16 * 1024 * 1024;

/// Maximum nesting depth accepted by the decoder.
const MAX_DEPTH: usize = 32;

/// Wire codec error.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("string of {0} bytes exceeds the {MAX_STRING_LEN}-byte limit")]
    StringTooLong(usize),
    #[error("message nesting exceeds depth {MAX_DEPTH}")]
    TooDeep,
    #[error("stream ended mid-message")]
    TruncatedStream,
}

/// Encode one message to bytes.
#[must_use]
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    encode_dict(msg.fields(), &mut out);
    out
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Str(s) => encode_str(s, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => encode_dict(dict, out),
    }
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(s.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(s.as_bytes());
}

fn encode_dict(dict: &Dict, out: &mut Vec<u8>) {
    out.push(b'd');
    for (key, value) in dict.iter() {
        encode_str(key, out);
        encode_value(value, out);
    }
    out.push(b'e');
}

/// Try to decode one complete message from the front of `buf`.
///
/// Consumes the decoded bytes on success. Returns `Ok(None)` if the buffer
/// holds only a prefix of a message.
///
/// # Errors
/// Returns `WireError` if the buffered bytes cannot be a valid message.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
    let (consumed, value) = {
        let mut parser = Parser { buf: &buf[..], pos: 0 };
        let value = parser.value(0)?;
        (parser.pos, value)
    };
    match value {
        None => Ok(None),
        Some(Value::Dict(dict)) => {
            buf.advance(consumed);
            Ok(Some(Message::from(dict)))
        }
        Some(_) => Err(WireError::Malformed(
            "top-level value must be a dictionary".into(),
        )),
    }
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn value(&mut self, depth: usize) -> Result<Option<Value>, WireError> {
        if depth > MAX_DEPTH {
            return Err(WireError::TooDeep);
        }
        match self.peek() {
            None => Ok(None),
            Some(b'i') => self.integer(),
            Some(b'0'..=b'9') => Ok(self.string()?.map(Value::Str)),
            Some(b'l') => self.list(depth),
            Some(b'd') => self.dict(depth),
            Some(byte) => Err(WireError::Malformed(format!(
                "unexpected byte {byte:#04x}"
            ))),
        }
    }

    fn integer(&mut self) -> Result<Option<Value>, WireError> {
        let start = self.pos + 1;
        let Some(rel) = self.buf[start..].iter().position(|&b| b == b'e') else {
            // i64 never needs more than 20 characters (sign included)
            if self.buf.len() - start > 20 {
                return Err(WireError::Malformed("unterminated integer".into()));
            }
            return Ok(None);
        };
        let digits = &self.buf[start..start + rel];
        let text = std::str::from_utf8(digits)
            .map_err(|_| WireError::Malformed("invalid integer literal".into()))?;
        let n: i64 = text
            .parse()
            .map_err(|_| WireError::Malformed(format!("invalid integer {text:?}")))?;
        self.pos = start + rel + 1;
        Ok(Some(Value::Int(n)))
    }

    fn string(&mut self) -> Result<Option<String>, WireError> {
        let start = self.pos;
        let Some(rel) = self.buf[start..].iter().position(|&b| b == b':') else {
            if self.buf.len() - start > 10 {
                return Err(WireError::Malformed("string length prefix too long".into()));
            }
            return Ok(None);
        };
        let digits = &self.buf[start..start + rel];
        let text = std::str::from_utf8(digits)
            .map_err(|_| WireError::Malformed("invalid string length".into()))?;
        let len: usize = text
            .parse()
            .map_err(|_| WireError::Malformed(format!("invalid string length {text:?}")))?;
        if len > MAX_STRING_LEN {
            return Err(WireError::StringTooLong(len));
        }
        let body = start + rel + 1;
        if self.buf.len() < body + len {
            return Ok(None);
        }
        let s = std::str::from_utf8(&self.buf[body..body + len])
            .map_err(|_| WireError::Malformed("string is not valid UTF-8".into()))?
            .to_owned();
        self.pos = body + len;
        Ok(Some(s))
    }

    fn list(&mut self, depth: usize) -> Result<Option<Value>, WireError> {
        let rollback = self.pos;
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => {
                    self.pos = rollback;
                    return Ok(None);
                }
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Some(Value::List(items)));
                }
                Some(_) => match self.value(depth + 1)? {
                    Some(item) => items.push(item),
                    None => {
                        self.pos = rollback;
                        return Ok(None);
                    }
                },
            }
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Option<Value>, WireError> {
        let rollback = self.pos;
        self.pos += 1;
        let mut dict = Dict::new();
        loop {
            match self.peek() {
                None => {
                    self.pos = rollback;
                    return Ok(None);
                }
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Some(Value::Dict(dict)));
                }
                Some(b'0'..=b'9') => {
                    let Some(key) = self.string()? else {
                        self.pos = rollback;
                        return Ok(None);
                    };
                    match self.value(depth + 1)? {
                        Some(value) => dict.set(key, value),
                        None => {
                            self.pos = rollback;
                            return Ok(None);
                        }
                    }
                }
                Some(byte) => {
                    return Err(WireError::Malformed(format!(
                        "dictionary key must be a string, got byte {byte:#04x}"
                    )));
                }
            }
        }
    }
}

/// Buffered message reader over an async byte stream.
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read the next complete message.
    ///
    /// Returns `Ok(None)` on clean end of stream (no partial message left
    /// buffered).
    ///
    /// # Errors
    /// Returns `WireError` on I/O failure, malformed input, or a stream that
    /// ends mid-message.
    pub async fn read_message(&mut self) -> Result<Option<Message>, WireError> {
        loop {
            if let Some(msg) = decode(&mut self.buf)? {
                return Ok(Some(msg));
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(WireError::TruncatedStream);
            }
        }
    }
}

/// Write one message and flush.
///
/// # Errors
/// Returns `WireError::Io` if the write fails.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), WireError> {
    writer.write_all(&encode(msg)).await?;
    writer.flush().await?;
    Ok(())
}
