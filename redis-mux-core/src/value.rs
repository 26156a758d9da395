//! RESP (`REdis` Serialization Protocol) value types
//!
//! A single value type covers both protocol generations. RESP3-only frames
//! (maps, sets, doubles, booleans, pushes) get their own variants; helpers such
//! as [`RespValue::as_pairs`] accept either the RESP2 or the RESP3 shape of the
//! same logical reply.

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;

/// RESP protocol value
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error: -ERR message\r\n (RESP3 blob errors decode to this as well)
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// Null bulk string ($-1), null array (*-1) or RESP3 null (_)
    Null,
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
    /// RESP3 boolean: #t\r\n
    Boolean(bool),
    /// RESP3 double: ,1.23\r\n
    Double(f64),
    /// RESP3 big number, kept in its textual form
    BigNumber(String),
    /// RESP3 verbatim string: =15\r\ntxt:Some string\r\n
    Verbatim {
        /// Three letter format hint (`txt`, `mkd`)
        format: String,
        /// The payload
        text: String,
    },
    /// RESP3 map, in wire order
    Map(Vec<(RespValue, RespValue)>),
    /// RESP3 set, in wire order
    Set(Vec<RespValue>),
    /// RESP3 out-of-band push frame
    Push(Vec<RespValue>),
}

impl RespValue {
    /// Convert to a string if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a string.
    pub fn as_string(&self) -> RedisResult<String> {
        match self {
            Self::SimpleString(s) | Self::BigNumber(s) => Ok(s.clone()),
            Self::BulkString(b) => String::from_utf8(b.to_vec())
                .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}"))),
            Self::Verbatim { text, .. } => Ok(text.clone()),
            Self::Integer(i) => Ok(i.to_string()),
            Self::Double(d) => Ok(d.to_string()),
            Self::Boolean(b) => Ok(b.to_string()),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to string"
            ))),
        }
    }

    /// Convert to an optional string, mapping null to `None`
    ///
    /// # Errors
    ///
    /// Returns an error if the value is neither null nor string-like.
    pub fn as_optional_string(&self) -> RedisResult<Option<String>> {
        if self.is_null() {
            Ok(None)
        } else {
            self.as_string().map(Some)
        }
    }

    /// Convert to an integer if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an integer.
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::Boolean(b) => Ok(i64::from(*b)),
            Self::BulkString(_) | Self::SimpleString(_) | Self::BigNumber(_) => {
                let s = self.as_string()?;
                s.parse::<i64>()
                    .map_err(|e| RedisError::Type(format!("Cannot parse integer: {e}")))
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to integer"
            ))),
        }
    }

    /// Convert to bytes if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to bytes.
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            Self::BulkString(b) => Ok(b.clone()),
            Self::SimpleString(s) => Ok(Bytes::from(s.as_bytes().to_vec())),
            Self::Verbatim { text, .. } => Ok(Bytes::from(text.as_bytes().to_vec())),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to bytes"
            ))),
        }
    }

    /// Convert to an array if possible
    ///
    /// Sets and pushes are returned as arrays; maps are flattened into the
    /// interleaved key/value layout RESP2 uses for the same reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an array.
    pub fn as_array(&self) -> RedisResult<Vec<Self>> {
        match self {
            Self::Array(arr) | Self::Set(arr) | Self::Push(arr) => Ok(arr.clone()),
            Self::Map(pairs) => Ok(pairs
                .iter()
                .flat_map(|(k, v)| [k.clone(), v.clone()])
                .collect()),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to array"
            ))),
        }
    }

    /// Interpret the value as key/value pairs
    ///
    /// Accepts a RESP3 map, a RESP2 interleaved array (`k1 v1 k2 v2`), or an
    /// array of two-element arrays.
    ///
    /// # Errors
    ///
    /// Returns an error for odd-length arrays and non-collection values.
    pub fn as_pairs(&self) -> RedisResult<Vec<(Self, Self)>> {
        match self {
            Self::Map(pairs) => Ok(pairs.clone()),
            Self::Array(items) => {
                let nested = !items.is_empty()
                    && items
                        .iter()
                        .all(|item| matches!(item, Self::Array(inner) if inner.len() == 2));
                if nested {
                    return Ok(items
                        .iter()
                        .filter_map(|item| match item {
                            Self::Array(inner) => Some((inner[0].clone(), inner[1].clone())),
                            _ => None,
                        })
                        .collect());
                }
                if items.len() % 2 != 0 {
                    return Err(RedisError::Type(format!(
                        "Expected an even number of elements, got {}",
                        items.len()
                    )));
                }
                Ok(items
                    .chunks(2)
                    .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
                    .collect())
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to pairs"
            ))),
        }
    }

    /// Look up a field in a map-shaped reply by its string key
    pub fn field(&self, name: &str) -> Option<Self> {
        self.as_pairs().ok()?.into_iter().find_map(|(k, v)| {
            match k.as_string() {
                Ok(key) if key.eq_ignore_ascii_case(name) => Some(v),
                _ => None,
            }
        })
    }

    /// Check if this is a null value
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this is an error
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Check if this is an out-of-band RESP3 push frame
    #[must_use]
    pub const fn is_push(&self) -> bool {
        matches!(self, Self::Push(_))
    }

    /// Extract error message if this is an error
    #[must_use]
    pub fn into_error(self) -> Option<String> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Short name of the frame type, used in diagnostics
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::SimpleString(_) => "simple-string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::BulkString(_) => "bulk-string",
            Self::Null => "null",
            Self::Array(_) => "array",
            Self::Boolean(_) => "boolean",
            Self::Double(_) => "double",
            Self::BigNumber(_) => "big-number",
            Self::Verbatim { .. } => "verbatim-string",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Push(_) => "push",
        }
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}
impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::from(s.as_bytes().to_vec()))
    }
}
impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}
impl From<Vec<u8>> for RespValue {
    fn from(b: Vec<u8>) -> Self {
        Self::BulkString(Bytes::from(b))
    }
}
impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}

impl TryFrom<RespValue> for String {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_string()
    }
}

impl TryFrom<RespValue> for i64 {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_int()
    }
}

impl TryFrom<RespValue> for bool {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        match value {
            RespValue::Boolean(b) => Ok(b),
            RespValue::Integer(1) => Ok(true),
            RespValue::Integer(0) => Ok(false),
            RespValue::SimpleString(s) if s == "OK" => Ok(true),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {:?} to bool",
                value
            ))),
        }
    }
}
