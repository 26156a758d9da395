//! RESP2/RESP3 wire codec
//!
//! The decoder is incremental: it returns `Ok(None)` when the buffer does not
//! yet hold a complete frame, leaving the caller to read more bytes and retry
//! from the same position.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use redis_mux_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";

/// Largest bulk payload accepted from the wire (512 MB, the server limit)
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Encodes RESP values into bytes
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a RESP value into a buffer
    pub fn encode(value: &RespValue, buf: &mut BytesMut) {
        match value {
            RespValue::SimpleString(s) => Self::line(buf, b'+', s.as_bytes()),
            RespValue::Error(e) => Self::line(buf, b'-', e.as_bytes()),
            RespValue::Integer(i) => Self::line(buf, b':', i.to_string().as_bytes()),
            RespValue::BulkString(data) => Self::bulk(buf, data),
            RespValue::Null => buf.put_slice(b"$-1\r\n"),
            RespValue::Array(arr) => {
                Self::header(buf, b'*', arr.len());
                for item in arr {
                    Self::encode(item, buf);
                }
            }
            RespValue::Boolean(b) => Self::line(buf, b'#', if *b { b"t" } else { b"f" }),
            RespValue::Double(d) => {
                let text = if d.is_infinite() {
                    if d.is_sign_positive() { "inf" } else { "-inf" }.to_string()
                } else {
                    d.to_string()
                };
                Self::line(buf, b',', text.as_bytes());
            }
            RespValue::BigNumber(n) => Self::line(buf, b'(', n.as_bytes()),
            RespValue::Verbatim { format, text } => {
                let content = format!("{format}:{text}");
                Self::header(buf, b'=', content.len());
                buf.put_slice(content.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Map(pairs) => {
                Self::header(buf, b'%', pairs.len());
                for (k, v) in pairs {
                    Self::encode(k, buf);
                    Self::encode(v, buf);
                }
            }
            RespValue::Set(items) => {
                Self::header(buf, b'~', items.len());
                for item in items {
                    Self::encode(item, buf);
                }
            }
            RespValue::Push(items) => {
                Self::header(buf, b'>', items.len());
                for item in items {
                    Self::encode(item, buf);
                }
            }
        }
    }

    /// Encode a request: an array of bulk strings
    pub fn encode_request<I, T>(parts: I, buf: &mut BytesMut)
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
        T: AsRef<[u8]>,
    {
        let parts = parts.into_iter();
        Self::header(buf, b'*', parts.len());
        for part in parts {
            Self::bulk(buf, part.as_ref());
        }
    }

    /// Encode a command with arguments
    pub fn encode_command(command: &str, args: &[RespValue]) -> Bytes {
        let mut buf = BytesMut::new();
        Self::header(&mut buf, b'*', 1 + args.len());
        Self::bulk(&mut buf, command.as_bytes());
        for arg in args {
            Self::encode(arg, &mut buf);
        }
        buf.freeze()
    }

    fn header(buf: &mut BytesMut, prefix: u8, len: usize) {
        buf.put_u8(prefix);
        buf.put_slice(len.to_string().as_bytes());
        buf.put_slice(CRLF);
    }

    fn line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
        buf.put_u8(prefix);
        buf.put_slice(body);
        buf.put_slice(CRLF);
    }

    fn bulk(buf: &mut BytesMut, data: &[u8]) {
        Self::header(buf, b'$', data.len());
        buf.put_slice(data);
        buf.put_slice(CRLF);
    }
}

/// How much of the frame at the head of a buffer has arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScan {
    /// A complete frame of this many bytes is buffered
    Complete(usize),
    /// The frame needs at least this many bytes in total
    Incomplete(usize),
}

/// Decodes RESP values from bytes
pub struct RespDecoder;

impl RespDecoder {
    /// Measure the frame at the start of `buf` without building it
    ///
    /// Blob payloads are skipped by their declared length, so a large bulk
    /// reply arriving in many reads is never re-parsed byte by byte.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Protocol`] on a malformed header.
    pub fn scan(buf: &[u8]) -> RedisResult<FrameScan> {
        let mut pos = 0usize;
        // values still to read, attributes count their payload plus the next frame
        let mut pending = 1usize;
        while pending > 0 {
            let Some(&type_byte) = buf.get(pos) else {
                return Ok(FrameScan::Incomplete(pos + 1));
            };
            let Some(end) = Self::find_crlf(buf, pos + 1) else {
                return Ok(FrameScan::Incomplete(buf.len() + 1));
            };
            let line = &buf[pos + 1..end];
            pos = end + 2;
            pending -= 1;

            match type_byte {
                b'$' | b'!' | b'=' => {
                    if let Some(len) = Self::scan_len(line)? {
                        if len > MAX_BULK_LEN {
                            return Err(RedisError::Protocol(format!(
                                "Bulk length {} exceeds limit",
                                len
                            )));
                        }
                        pos += len + 2;
                        if buf.len() < pos {
                            return Ok(FrameScan::Incomplete(pos));
                        }
                    }
                }
                b'*' | b'~' | b'>' => {
                    pending = pending.saturating_add(Self::scan_len(line)?.unwrap_or(0));
                }
                b'%' => {
                    let len = Self::scan_len(line)?.unwrap_or(0);
                    pending = pending.saturating_add(len.saturating_mul(2));
                }
                b'|' => {
                    let len = Self::scan_len(line)?.unwrap_or(0);
                    pending = pending.saturating_add(len.saturating_mul(2)).saturating_add(1);
                }
                b'+' | b'-' | b':' | b'_' | b'#' | b',' | b'(' => {}
                other => {
                    return Err(RedisError::Protocol(format!(
                        "Invalid RESP type byte: {}",
                        other as char
                    )))
                }
            }
        }
        Ok(FrameScan::Complete(pos))
    }

    fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
        let tail = buf.get(from..)?;
        tail.windows(2)
            .position(|pair| pair == CRLF)
            .map(|offset| from + offset)
    }

    fn scan_len(line: &[u8]) -> RedisResult<Option<usize>> {
        let text = std::str::from_utf8(line)
            .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {}", e)))?;
        match Self::parse_int(text)? {
            -1 => Ok(None),
            n if n < 0 => Err(RedisError::Protocol(format!("Invalid length: {}", n))),
            n => usize::try_from(n)
                .map(Some)
                .map_err(|_| RedisError::Protocol(format!("Invalid length: {}", n))),
        }
    }

    /// Decode a RESP value from a buffer
    ///
    /// On `Ok(None)` the cursor position is unspecified; callers restart from
    /// the beginning of the unconsumed data once more bytes arrive.
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let type_byte = buf.chunk()[0];
        buf.advance(1);

        match type_byte {
            b'+' => Ok(Self::read_text(buf)?.map(RespValue::SimpleString)),
            b'-' => Ok(Self::read_text(buf)?.map(RespValue::Error)),
            b':' => match Self::read_text(buf)? {
                Some(line) => Ok(Some(RespValue::Integer(Self::parse_int(&line)?))),
                None => Ok(None),
            },
            b'$' => Self::decode_blob(buf, RespValue::BulkString),
            b'!' => Self::decode_blob(buf, |data| {
                RespValue::Error(String::from_utf8_lossy(&data).into_owned())
            }),
            b'=' => Self::decode_blob(buf, |data| {
                let text = String::from_utf8_lossy(&data).into_owned();
                match text.split_once(':') {
                    Some((format, rest)) if format.len() == 3 => RespValue::Verbatim {
                        format: format.to_string(),
                        text: rest.to_string(),
                    },
                    _ => RespValue::Verbatim {
                        format: "txt".to_string(),
                        text,
                    },
                }
            }),
            b'*' => Self::decode_sequence(buf, RespValue::Array),
            b'~' => Self::decode_sequence(buf, RespValue::Set),
            b'>' => Self::decode_sequence(buf, RespValue::Push),
            b'%' => Self::decode_map(buf),
            b'|' => {
                // Attributes describe the next frame; the frame itself is the reply
                if Self::decode_map(buf)?.is_none() {
                    return Ok(None);
                }
                Self::decode(buf)
            }
            b'_' => Ok(Self::read_line(buf)?.map(|_| RespValue::Null)),
            b'#' => match Self::read_line(buf)? {
                Some(line) => match line.as_slice() {
                    b"t" => Ok(Some(RespValue::Boolean(true))),
                    b"f" => Ok(Some(RespValue::Boolean(false))),
                    _ => Err(RedisError::Protocol(format!(
                        "Invalid boolean: {}",
                        String::from_utf8_lossy(&line)
                    ))),
                },
                None => Ok(None),
            },
            b',' => match Self::read_text(buf)? {
                Some(line) => {
                    let value = match line.as_str() {
                        "inf" => f64::INFINITY,
                        "-inf" => f64::NEG_INFINITY,
                        other => other.parse::<f64>().map_err(|e| {
                            RedisError::Protocol(format!("Invalid double: {}", e))
                        })?,
                    };
                    Ok(Some(RespValue::Double(value)))
                }
                None => Ok(None),
            },
            b'(' => Ok(Self::read_text(buf)?.map(RespValue::BigNumber)),
            _ => Err(RedisError::Protocol(format!(
                "Invalid RESP type byte: {}",
                type_byte as char
            ))),
        }
    }

    fn decode_blob(
        buf: &mut Cursor<&[u8]>,
        build: impl FnOnce(Bytes) -> RespValue,
    ) -> RedisResult<Option<RespValue>> {
        let len = match Self::read_len(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let len = match len {
            None => return Ok(Some(RespValue::Null)),
            Some(len) if len > MAX_BULK_LEN => {
                return Err(RedisError::Protocol(format!(
                    "Bulk length {} exceeds limit",
                    len
                )))
            }
            Some(len) => len,
        };

        // Payload plus CRLF
        if buf.remaining() < len + 2 {
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
        buf.advance(len);
        if &buf.chunk()[..2] != CRLF {
            return Err(RedisError::Protocol(
                "Bulk string not terminated by CRLF".to_string(),
            ));
        }
        buf.advance(2);

        Ok(Some(build(data)))
    }

    fn decode_sequence(
        buf: &mut Cursor<&[u8]>,
        build: impl FnOnce(Vec<RespValue>) -> RespValue,
    ) -> RedisResult<Option<RespValue>> {
        let len = match Self::read_len(buf)? {
            Some(Some(len)) => len,
            Some(None) => return Ok(Some(RespValue::Null)),
            None => return Ok(None),
        };

        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            match Self::decode(buf)? {
                Some(value) => items.push(value),
                None => return Ok(None),
            }
        }

        Ok(Some(build(items)))
    }

    fn decode_map(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        let len = match Self::read_len(buf)? {
            Some(Some(len)) => len,
            Some(None) => return Ok(Some(RespValue::Null)),
            None => return Ok(None),
        };

        let mut pairs = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            let key = match Self::decode(buf)? {
                Some(key) => key,
                None => return Ok(None),
            };
            let value = match Self::decode(buf)? {
                Some(value) => value,
                None => return Ok(None),
            };
            pairs.push((key, value));
        }

        Ok(Some(RespValue::Map(pairs)))
    }

    /// `Some(None)` is the RESP2 "-1" null length
    fn read_len(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Option<usize>>> {
        let line = match Self::read_text(buf)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let len = Self::parse_int(&line)?;
        match len {
            -1 => Ok(Some(None)),
            n if n < 0 => Err(RedisError::Protocol(format!("Invalid length: {}", n))),
            n => Ok(Some(Some(n as usize))),
        }
    }

    fn parse_int(line: &str) -> RedisResult<i64> {
        line.parse::<i64>()
            .map_err(|e| RedisError::Protocol(format!("Invalid integer '{}': {}", line, e)))
    }

    fn read_text(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<String>> {
        match Self::read_line(buf)? {
            Some(line) => String::from_utf8(line)
                .map(Some)
                .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    fn read_line(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Vec<u8>>> {
        let start = buf.position() as usize;
        let slice = buf.get_ref();

        // Find CRLF
        for i in start..slice.len().saturating_sub(1) {
            if slice[i] == b'\r' && slice[i + 1] == b'\n' {
                let line = slice[start..i].to_vec();
                buf.set_position((i + 2) as u64);
                return Ok(Some(line));
            }
        }

        Ok(None)
    }
}
