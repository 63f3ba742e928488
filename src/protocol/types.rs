//! RESP (Redis Serialization Protocol) Data Types
//!
//! This module defines the closed set of values the server can put on the
//! wire, together with their encoder. Every RESP2 type and the RESP3 types a
//! reply may need are represented; encoding is a structural recursion with
//! one exhaustive `match`, so adding a variant without teaching the encoder
//! about it fails to compile.
//!
//! ## Protocol Format
//!
//! Each value starts with a one-byte type prefix and ends with CRLF:
//!
//! | Prefix | Type            | Example                         |
//! |--------|-----------------|---------------------------------|
//! | `+`    | Simple String   | `+OK\r\n`                       |
//! | `-`    | Error           | `-ERR unknown command\r\n`      |
//! | `:`    | Integer         | `:1000\r\n`                     |
//! | `$`    | Bulk String     | `$5\r\nhello\r\n`               |
//! | `*`    | Array           | `*1\r\n$4\r\nPING\r\n`          |
//! | `_`    | Null (RESP3)    | `_\r\n`                         |
//! | `#`    | Boolean         | `#t\r\n`                        |
//! | `,`    | Double          | `,1.5\r\n`                      |
//! | `(`    | Big Number      | `(3492890328409238509324850\r\n` |
//! | `!`    | Bulk Error      | `!10\r\nERR failed\r\n`         |
//! | `=`    | Verbatim String | `=9\r\ntxt:hello\r\n`           |
//! | `%`    | Map             | `%1\r\n+key\r\n:1\r\n`          |
//!
//! The server speaks RESP2 to clients, so [`RespValue::Null`] is written as
//! the null bulk string `$-1\r\n`.

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
    pub const NULL: u8 = b'_';
    pub const BOOLEAN: u8 = b'#';
    pub const DOUBLE: u8 = b',';
    pub const BIG_NUMBER: u8 = b'(';
    pub const BULK_ERROR: u8 = b'!';
    pub const VERBATIM: u8 = b'=';
    pub const MAP: u8 = b'%';
    pub const SET: u8 = b'~';
    pub const PUSH: u8 = b'>';
}

/// Represents a value in the RESP protocol.
///
/// Used both for decoded input and for replies. Line-based variants
/// (`SimpleString`, `Error`, `BigNumber` and map keys) must not contain CR or
/// LF; the constructors below enforce that.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Non-binary-safe single line string.
    /// Format: `+<string>\r\n`
    SimpleString(String),

    /// Single line error.
    /// Format: `-<error message>\r\n`
    Error(String),

    /// 64-bit signed integer.
    /// Format: `:<integer>\r\n`
    Integer(i64),

    /// Binary-safe string.
    /// Format: `$<length>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Absent value. Encoded as the RESP2 null bulk string `$-1\r\n`.
    Null,

    /// Format: `#t\r\n` or `#f\r\n`
    Boolean(bool),

    /// Format: `,<float>\r\n`, with `inf`, `-inf` and `nan` for non-finite values
    Double(f64),

    /// Arbitrary precision integer kept in its decimal text form.
    /// Format: `(<digits>\r\n`
    BigNumber(String),

    /// Binary-safe error.
    /// Format: `!<length>\r\n<error>\r\n`
    BulkError(String),

    /// Text with a three byte format hint such as `txt` or `mkd`.
    /// Format: `=<length>\r\n<enc>:<text>\r\n`, the length covering `enc:` too.
    Verbatim { encoding: [u8; 3], text: String },

    /// Format: `*<count>\r\n<element1><element2>...`
    Array(Vec<RespValue>),

    /// Ordered key/value pairs with simple string keys.
    /// Format: `%<pairs>\r\n<key1><value1>...`
    Map(Vec<(String, RespValue)>),
}

/// Returned by [`RespValue::try_simple_string`] when the text spans lines.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("simple strings cannot contain CR or LF")]
pub struct LineBreakError;

impl RespValue {
    /// Creates a new simple string response.
    ///
    /// CR and LF are replaced with spaces so the value always frames as one line.
    ///
    /// # Example
    /// ```
    /// use ferrokv::protocol::types::RespValue;
    /// let ok = RespValue::simple_string("OK");
    /// assert_eq!(ok.serialize(), b"+OK\r\n");
    /// ```
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(single_line(s.into()))
    }

    /// Creates a simple string, rejecting text that contains CR or LF.
    pub fn try_simple_string(s: impl Into<String>) -> Result<Self, LineBreakError> {
        let s = s.into();
        if s.contains(['\r', '\n']) {
            return Err(LineBreakError);
        }
        Ok(RespValue::SimpleString(s))
    }

    /// Creates a new error response.
    ///
    /// # Example
    /// ```
    /// use ferrokv::protocol::types::RespValue;
    /// let err = RespValue::error("ERR unknown command");
    /// assert!(err.is_error());
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(single_line(s.into()))
    }

    /// Creates a new integer response.
    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Creates a new bulk string response.
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Creates a null response.
    pub fn null() -> Self {
        RespValue::Null
    }

    /// Creates an array response.
    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// Creates a plain text verbatim string.
    pub fn verbatim_text(text: impl Into<String>) -> Self {
        RespValue::Verbatim {
            encoding: *b"txt",
            text: text.into(),
        }
    }

    /// Common response for successful operations
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Common response for PONG
    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Serializes the RESP value to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the RESP value into an existing buffer.
    ///
    /// Sessions use this to encode a whole batch of replies into one buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, prefix::SIMPLE_STRING, s),
            RespValue::Error(s) => write_line(buf, prefix::ERROR, s),
            RespValue::Integer(n) => write_line(buf, prefix::INTEGER, &n.to_string()),
            RespValue::BulkString(data) => write_blob(buf, prefix::BULK_STRING, &[&data[..]]),
            RespValue::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            RespValue::Boolean(b) => {
                buf.push(prefix::BOOLEAN);
                buf.push(if *b { b't' } else { b'f' });
                buf.extend_from_slice(CRLF);
            }
            RespValue::Double(d) => write_line(buf, prefix::DOUBLE, &format_double(*d)),
            RespValue::BigNumber(n) => write_line(buf, prefix::BIG_NUMBER, n),
            RespValue::BulkError(s) => write_blob(buf, prefix::BULK_ERROR, &[s.as_bytes()]),
            RespValue::Verbatim { encoding, text } => write_blob(
                buf,
                prefix::VERBATIM,
                &[&encoding[..], &b":"[..], text.as_bytes()],
            ),
            RespValue::Array(values) => {
                write_header(buf, prefix::ARRAY, values.len());
                for value in values {
                    value.serialize_into(buf);
                }
            }
            RespValue::Map(pairs) => {
                write_header(buf, prefix::MAP, pairs.len());
                for (key, value) in pairs {
                    write_line(buf, prefix::SIMPLE_STRING, key);
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Number of bytes [`serialize`](Self::serialize) would produce.
    pub fn encoded_len(&self) -> usize {
        fn digits(n: usize) -> usize {
            n.to_string().len()
        }
        match self {
            RespValue::SimpleString(s) | RespValue::Error(s) | RespValue::BigNumber(s) => {
                s.len() + 3
            }
            RespValue::Integer(n) => n.to_string().len() + 3,
            RespValue::BulkString(data) => 1 + digits(data.len()) + 2 + data.len() + 2,
            RespValue::Null => 5,
            RespValue::Boolean(_) => 4,
            RespValue::Double(d) => format_double(*d).len() + 3,
            RespValue::BulkError(s) => 1 + digits(s.len()) + 2 + s.len() + 2,
            RespValue::Verbatim { text, .. } => {
                let len = text.len() + 4;
                1 + digits(len) + 2 + len + 2
            }
            RespValue::Array(values) => {
                1 + digits(values.len()) + 2 + values.iter().map(Self::encoded_len).sum::<usize>()
            }
            RespValue::Map(pairs) => {
                1 + digits(pairs.len())
                    + 2
                    + pairs
                        .iter()
                        .map(|(k, v)| k.len() + 3 + v.encoded_len())
                        .sum::<usize>()
            }
        }
    }

    /// Returns true if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_) | RespValue::BulkError(_))
    }

    /// Attempts to extract the inner string from SimpleString or BulkString.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Attempts to extract the inner bytes from BulkString.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// Attempts to extract the inner integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Attempts to extract the inner array.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Consumes self and returns the inner array if this is an Array variant.
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

fn single_line(s: String) -> String {
    if s.contains(['\r', '\n']) {
        s.replace(['\r', '\n'], " ")
    } else {
        s
    }
}

/// Writes `<prefix><line>\r\n`. Stray line breaks in hand-built values are
/// flattened so a reply can never split into two frames.
fn write_line(buf: &mut Vec<u8>, prefix: u8, line: &str) {
    buf.push(prefix);
    buf.extend(
        line.bytes()
            .map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b }),
    );
    buf.extend_from_slice(CRLF);
}

fn write_header(buf: &mut Vec<u8>, prefix: u8, len: usize) {
    buf.push(prefix);
    buf.extend_from_slice(len.to_string().as_bytes());
    buf.extend_from_slice(CRLF);
}

/// Writes a length-prefixed payload assembled from `parts`.
fn write_blob(buf: &mut Vec<u8>, prefix: u8, parts: &[&[u8]]) {
    let len = parts.iter().map(|p| p.len()).sum();
    write_header(buf, prefix, len);
    for part in parts {
        buf.extend_from_slice(part);
    }
    buf.extend_from_slice(CRLF);
}

/// Canonical text form of a double.
///
/// Rust's `Display` for `f64` is the shortest string that parses back to the
/// same value and never uses exponent notation.
pub(crate) fn format_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d.is_infinite() {
        let text = if d > 0.0 { "inf" } else { "-inf" };
        text.to_string()
    } else {
        d.to_string()
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Error(s) | RespValue::BulkError(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Boolean(b) => write!(f, "({})", b),
            RespValue::Double(d) => write!(f, "(double) {}", format_double(*d)),
            RespValue::BigNumber(n) => write!(f, "(big number) {}", n),
            RespValue::Verbatim { text, .. } => write!(f, "\"{}\"", text),
            RespValue::Array(values) => {
                if values.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    writeln!(f)?;
                    for (i, v) in values.iter().enumerate() {
                        writeln!(f, "{}) {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
            RespValue::Map(pairs) => {
                if pairs.is_empty() {
                    write!(f, "(empty map)")
                } else {
                    writeln!(f)?;
                    for (i, (k, v)) in pairs.iter().enumerate() {
                        writeln!(f, "{}# \"{}\" => {}", i + 1, k, v)?;
                    }
                    Ok(())
                }
            }
        }
    }
}
