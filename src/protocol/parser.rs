//! Incremental RESP Protocol Parser
//!
//! This module decodes RESP2 and RESP3 values from a byte buffer.
//!
//! ## How the Parser Works
//!
//! [`RespParser::parse`] reads one value from the front of a buffer and
//! returns either:
//! - `Ok(Some((value, consumed)))` - a whole value, `consumed` bytes were used
//! - `Ok(None)` - the value is incomplete, more bytes are needed
//! - `Err(ParseError)` - the bytes can never become a valid value
//!
//! Length-prefixed payloads (bulk strings, bulk errors, verbatim strings) are
//! taken by count and then checked for their CRLF, so binary payloads that
//! happen to contain `\r\n` are never split. Only line-based fields are found
//! by scanning for the terminator.
//!
//! [`decode`] is the batch form: it reads every whole value in a buffer and
//! fails with [`ParseError::Incomplete`] if the buffer stops inside one.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// The buffer ended inside a value
    #[error("incomplete value after {consumed} bytes")]
    Incomplete { consumed: usize },

    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer or length header
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid double
    #[error("invalid double: {0}")]
    InvalidDouble(String),

    /// Invalid UTF-8 in a line-based value
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum aggregate nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

type Parsed = ParseResult<Option<(RespValue, usize)>>;

/// An incremental RESP parser.
///
/// # Example
///
/// ```
/// use ferrokv::protocol::parser::RespParser;
/// use ferrokv::protocol::RespValue;
///
/// let mut parser = RespParser::new();
/// let (value, consumed) = parser.parse(b":42\r\n+OK").unwrap().unwrap();
/// assert_eq!(value, RespValue::Integer(42));
/// assert_eq!(consumed, 5);
/// assert!(parser.parse(b"+OK").unwrap().is_none());
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    /// Current nesting depth (for aggregate parsing)
    depth: usize,
}

impl RespParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one RESP value from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> Parsed {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> Parsed {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::SIMPLE_STRING => {
                Ok(read_line(buf)?.map(|(s, n)| (RespValue::SimpleString(s.to_string()), n)))
            }
            prefix::ERROR => Ok(read_line(buf)?.map(|(s, n)| (RespValue::Error(s.to_string()), n))),
            prefix::INTEGER => match read_line(buf)? {
                Some((s, n)) => Ok(Some((RespValue::Integer(parse_int(s)?), n))),
                None => Ok(None),
            },
            prefix::NULL => match read_line(buf)? {
                Some(("", n)) => Ok(Some((RespValue::Null, n))),
                Some((s, _)) => Err(ParseError::ProtocolError(format!(
                    "unexpected payload after null: {:?}",
                    s
                ))),
                None => Ok(None),
            },
            prefix::BOOLEAN => match read_line(buf)? {
                Some(("t", n)) => Ok(Some((RespValue::Boolean(true), n))),
                Some(("f", n)) => Ok(Some((RespValue::Boolean(false), n))),
                Some((s, _)) => Err(ParseError::ProtocolError(format!(
                    "invalid boolean: {:?}",
                    s
                ))),
                None => Ok(None),
            },
            prefix::DOUBLE => match read_line(buf)? {
                Some((s, n)) => {
                    let d: f64 = s
                        .parse()
                        .map_err(|_| ParseError::InvalidDouble(s.to_string()))?;
                    Ok(Some((RespValue::Double(d), n)))
                }
                None => Ok(None),
            },
            prefix::BIG_NUMBER => match read_line(buf)? {
                Some((s, n)) => {
                    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
                    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(ParseError::InvalidInteger(s.to_string()));
                    }
                    Ok(Some((RespValue::BigNumber(s.to_string()), n)))
                }
                None => Ok(None),
            },
            prefix::BULK_STRING => match read_blob(buf)? {
                Some((Some(data), n)) => {
                    Ok(Some((RespValue::BulkString(Bytes::copy_from_slice(data)), n)))
                }
                Some((None, n)) => Ok(Some((RespValue::Null, n))),
                None => Ok(None),
            },
            prefix::BULK_ERROR => match read_blob(buf)? {
                Some((Some(data), n)) => Ok(Some((RespValue::BulkError(utf8(data)?), n))),
                Some((None, _)) => Err(ParseError::InvalidBulkLength(-1)),
                None => Ok(None),
            },
            prefix::VERBATIM => match read_blob(buf)? {
                Some((Some(data), n)) => {
                    if data.len() < 4 || data[3] != b':' {
                        return Err(ParseError::ProtocolError(
                            "verbatim string missing encoding".to_string(),
                        ));
                    }
                    let encoding = [data[0], data[1], data[2]];
                    let text = utf8(&data[4..])?;
                    Ok(Some((RespValue::Verbatim { encoding, text }, n)))
                }
                Some((None, _)) => Err(ParseError::InvalidBulkLength(-1)),
                None => Ok(None),
            },
            prefix::ARRAY | prefix::SET | prefix::PUSH => self.parse_array(buf),
            prefix::MAP => self.parse_map(buf),
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Parses an array: `*<count>\r\n<elements...>`. Sets and pushes share
    /// the layout and decode to arrays as well.
    fn parse_array(&mut self, buf: &[u8]) -> Parsed {
        let (count, mut consumed) = match read_header(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if count == -1 {
            return Ok(Some((RespValue::Null, consumed)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        // Cap the preallocation; a hostile header must not reserve gigabytes
        let mut elements = Vec::with_capacity((count as usize).min(1024));

        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }

    /// Parses a map: `%<pairs>\r\n<key><value>...`
    fn parse_map(&mut self, buf: &[u8]) -> Parsed {
        let (count, mut consumed) = match read_header(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        let mut pairs = Vec::with_capacity((count as usize).min(1024));

        self.depth += 1;
        for _ in 0..count {
            let key = match self.parse_value(&buf[consumed..])? {
                Some((key, used)) => {
                    consumed += used;
                    key
                }
                None => return Ok(None),
            };
            let key = match key {
                RespValue::SimpleString(s) => s,
                RespValue::BulkString(b) => utf8(&b)?,
                other => {
                    return Err(ParseError::ProtocolError(format!(
                        "map keys must be strings, got {:?}",
                        other
                    )))
                }
            };
            match self.parse_value(&buf[consumed..])? {
                Some((value, used)) => {
                    pairs.push((key, value));
                    consumed += used;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Map(pairs), consumed)))
    }
}

/// Reads `<prefix><line>\r\n`, returning the line and the bytes consumed.
fn read_line(buf: &[u8]) -> ParseResult<Option<(&str, usize)>> {
    match find_crlf(&buf[1..]) {
        Some(pos) => {
            let line = std::str::from_utf8(&buf[1..1 + pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Ok(Some((line, 1 + pos + 2)))
        }
        None => Ok(None),
    }
}

/// Reads an integer header line such as `*3\r\n` or `$5\r\n`.
fn read_header(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    match read_line(buf)? {
        Some((s, n)) => Ok(Some((parse_int(s)?, n))),
        None => Ok(None),
    }
}

/// Reads `<prefix><len>\r\n<payload>\r\n`. A length of -1 yields `None` for
/// the payload.
fn read_blob(buf: &[u8]) -> ParseResult<Option<(Option<&[u8]>, usize)>> {
    let (length, data_start) = match read_header(buf)? {
        Some(header) => header,
        None => return Ok(None),
    };

    if length == -1 {
        return Ok(Some((None, data_start)));
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }

    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let total_needed = data_start + length + 2;
    if buf.len() < total_needed {
        return Ok(None);
    }

    if &buf[data_start + length..total_needed] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk payload missing trailing CRLF".to_string(),
        ));
    }

    Ok(Some((Some(&buf[data_start..data_start + length]), total_needed)))
}

fn parse_int(s: &str) -> ParseResult<i64> {
    s.parse()
        .map_err(|_| ParseError::InvalidInteger(s.to_string()))
}

fn utf8(data: &[u8]) -> ParseResult<String> {
    String::from_utf8(data.to_vec()).map_err(|e| ParseError::InvalidUtf8(e.to_string()))
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Helper function to parse a single RESP message from bytes.
pub fn parse_message(buf: &[u8]) -> Parsed {
    RespParser::new().parse(buf)
}

/// Decodes every whole value in `buf`.
///
/// Returns the values and the number of bytes they occupied. A buffer that
/// ends inside a value is an error rather than a short result.
pub fn decode(buf: &[u8]) -> ParseResult<(Vec<RespValue>, usize)> {
    let mut parser = RespParser::new();
    let mut values = Vec::new();
    let mut consumed = 0;

    while consumed < buf.len() {
        match parser.parse(&buf[consumed..])? {
            Some((value, used)) => {
                values.push(value);
                consumed += used;
            }
            None => return Err(ParseError::Incomplete { consumed }),
        }
    }

    Ok((values, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_string() {
        let input = b"+OK\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(result.0, RespValue::SimpleString("OK".to_string()));
        assert_eq!(result.1, 5);
    }

    #[test]
    fn test_parse_simple_string_incomplete() {
        assert!(parse_message(b"+OK").unwrap().is_none());
        assert!(parse_message(b"+OK\r").unwrap().is_none());
    }

    #[test]
    fn test_parse_error() {
        let input = b"-ERR unknown command\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(
            result.0,
            RespValue::Error("ERR unknown command".to_string())
        );
        assert_eq!(result.1, 22);
    }

    #[test]
    fn test_parse_integer() {
        let result = parse_message(b":1000\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Integer(1000));
        assert_eq!(result.1, 7);

        let result = parse_message(b":-42\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Integer(-42));
    }

    #[test]
    fn test_parse_bulk_string() {
        let input = b"$5\r\nhello\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(result.0, RespValue::BulkString(Bytes::from("hello")));
        assert_eq!(result.1, 11);
    }

    #[test]
    fn test_parse_null_forms() {
        assert_eq!(parse_message(b"$-1\r\n").unwrap().unwrap(), (RespValue::Null, 5));
        assert_eq!(parse_message(b"*-1\r\n").unwrap().unwrap(), (RespValue::Null, 5));
        assert_eq!(parse_message(b"_\r\n").unwrap().unwrap(), (RespValue::Null, 3));
    }

    #[test]
    fn test_parse_empty_bulk_string() {
        let result = parse_message(b"$0\r\n\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::BulkString(Bytes::from("")));
        assert_eq!(result.1, 6);
    }

    #[test]
    fn test_parse_bulk_string_incomplete() {
        assert!(parse_message(b"$5\r\nhel").unwrap().is_none());
        assert!(parse_message(b"$5\r\nhello\r").unwrap().is_none());
    }

    #[test]
    fn test_parse_bulk_string_bad_terminator() {
        let result = parse_message(b"$5\r\nhelloXY");
        assert!(matches!(result, Err(ParseError::ProtocolError(_))));
    }

    #[test]
    fn test_bulk_payload_containing_crlf() {
        let input = b"$6\r\na\r\nb\r\n\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(value, RespValue::BulkString(Bytes::from_static(b"a\r\nb\r\n")));
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_parse_array() {
        let input = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(
            result.0,
            RespValue::Array(vec![
                RespValue::BulkString(Bytes::from("GET")),
                RespValue::BulkString(Bytes::from("name")),
            ])
        );
        assert_eq!(result.1, 23);
    }

    #[test]
    fn test_parse_array_incomplete() {
        assert!(parse_message(b"*2\r\n$3\r\nGET\r\n").unwrap().is_none());
        assert!(parse_message(b"*2\r\n").unwrap().is_none());
    }

    #[test]
    fn test_parse_empty_array() {
        let result = parse_message(b"*0\r\n").unwrap().unwrap();
        assert_eq!(result, (RespValue::Array(vec![]), 4));
    }

    #[test]
    fn test_parse_nested_array() {
        let input = b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(
            result.0,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Integer(2), RespValue::Integer(3)]),
            ])
        );
    }

    #[test]
    fn test_parse_resp3_scalars() {
        assert_eq!(parse_message(b"#t\r\n").unwrap().unwrap().0, RespValue::Boolean(true));
        assert_eq!(parse_message(b"#f\r\n").unwrap().unwrap().0, RespValue::Boolean(false));
        assert_eq!(parse_message(b",3.25\r\n").unwrap().unwrap().0, RespValue::Double(3.25));
        assert_eq!(
            parse_message(b",-inf\r\n").unwrap().unwrap().0,
            RespValue::Double(f64::NEG_INFINITY)
        );
        assert_eq!(
            parse_message(b"(-12345678901234567890123\r\n").unwrap().unwrap().0,
            RespValue::BigNumber("-12345678901234567890123".to_string())
        );
        assert_eq!(
            parse_message(b"!5\r\nERR x\r\n").unwrap().unwrap().0,
            RespValue::BulkError("ERR x".to_string())
        );
        assert_eq!(
            parse_message(b"=7\r\nmkd:# a\r\n").unwrap().unwrap().0,
            RespValue::Verbatim {
                encoding: *b"mkd",
                text: "# a".to_string()
            }
        );
    }

    #[test]
    fn test_parse_map_and_set() {
        let (value, _) = parse_message(b"%1\r\n+a\r\n:1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Map(vec![("a".to_string(), RespValue::Integer(1))]));

        let (value, _) = parse_message(b"~2\r\n:1\r\n:2\r\n").unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![RespValue::Integer(1), RespValue::Integer(2)])
        );
    }

    #[test]
    fn test_parse_unknown_prefix() {
        assert_eq!(
            parse_message(b"@invalid\r\n"),
            Err(ParseError::UnknownPrefix(b'@'))
        );
    }

    #[test]
    fn test_parse_invalid_integer() {
        let result = parse_message(b":not_a_number\r\n");
        assert!(matches!(result, Err(ParseError::InvalidInteger(_))));

        let result = parse_message(b"$abc\r\nxyz\r\n");
        assert!(matches!(result, Err(ParseError::InvalidInteger(_))));
    }

    #[test]
    fn test_parse_invalid_boolean() {
        assert!(parse_message(b"#x\r\n").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let mut input = Vec::new();
        for _ in 0..=MAX_NESTING_DEPTH + 1 {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        assert!(matches!(
            parse_message(&input),
            Err(ParseError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_decode_multiple_values() {
        let (values, consumed) = decode(b"+OK\r\n:1\r\n$1\r\nx\r\n").unwrap();
        assert_eq!(
            values,
            vec![
                RespValue::ok(),
                RespValue::Integer(1),
                RespValue::BulkString(Bytes::from("x")),
            ]
        );
        assert_eq!(consumed, 16);
    }

    #[test]
    fn test_decode_reports_truncation() {
        assert_eq!(
            decode(b"+OK\r\n$5\r\nhel"),
            Err(ParseError::Incomplete { consumed: 5 })
        );
    }

    #[test]
    fn test_roundtrip_every_variant() {
        let values = vec![
            RespValue::simple_string("OK"),
            RespValue::error("ERR nope"),
            RespValue::integer(i64::MIN),
            RespValue::bulk_string(Bytes::from_static(b"\x00\r\n\xff")),
            RespValue::Null,
            RespValue::Boolean(false),
            RespValue::Double(0.1),
            RespValue::Double(-1e300),
            RespValue::Double(f64::INFINITY),
            RespValue::BigNumber("123456789012345678901234567890".to_string()),
            RespValue::BulkError("ERR\r\nmulti".to_string()),
            RespValue::verbatim_text("hello\r\nworld"),
            RespValue::array(vec![]),
            RespValue::Map(vec![
                ("k".to_string(), RespValue::array(vec![RespValue::Null])),
                ("m".to_string(), RespValue::Map(vec![])),
            ]),
        ];

        for value in values {
            let encoded = value.serialize();
            let (decoded, consumed) = decode(&encoded).unwrap();
            assert_eq!(decoded, vec![value.clone()]);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_binary_safe_bulk_string() {
        let input = b"$5\r\nhel\x00o\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(
            result.0,
            RespValue::BulkString(Bytes::from(&b"hel\x00o"[..]))
        );
    }
}
