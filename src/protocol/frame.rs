//! Client request frames.
//!
//! A frame is what a client sends: a RESP array of bulk strings whose first
//! element names the command. Anything else on the request side is a
//! protocol error.

use crate::protocol::types::RespValue;
use bytes::Bytes;
use std::fmt;

/// One decoded request. Never empty; element 0 is the command name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<Bytes>);

/// Why a decoded value is not a valid request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("expected '*', got '{0}'")]
    NotAnArray(char),

    #[error("expected '$', got '{0}'")]
    NotABulkString(char),

    #[error("empty request")]
    Empty,
}

impl Frame {
    /// Builds a frame from its parts. Returns `None` for an empty list.
    pub fn new(parts: Vec<Bytes>) -> Option<Self> {
        if parts.is_empty() {
            None
        } else {
            Some(Self(parts))
        }
    }

    /// Convenience constructor for tests and the replica handshake.
    ///
    /// # Panics
    ///
    /// Panics if `parts` is empty.
    pub fn from_strs(parts: &[&str]) -> Self {
        assert!(!parts.is_empty(), "a frame needs a command name");
        Self(
            parts
                .iter()
                .map(|part| Bytes::copy_from_slice(part.as_bytes()))
                .collect(),
        )
    }

    /// The command name as sent.
    pub fn name(&self) -> &Bytes {
        &self.0[0]
    }

    /// The command name, lowercased, for dispatch and error messages.
    pub fn command_name(&self) -> String {
        String::from_utf8_lossy(&self.0[0]).to_ascii_lowercase()
    }

    /// Everything after the command name.
    pub fn args(&self) -> &[Bytes] {
        &self.0[1..]
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; a frame holds at least the command name.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Size of this frame on the wire as an array of bulk strings.
    pub fn encoded_len(&self) -> usize {
        fn header(prefix_len: usize) -> usize {
            1 + prefix_len.to_string().len() + 2
        }
        header(self.0.len())
            + self
                .0
                .iter()
                .map(|part| header(part.len()) + part.len() + 2)
                .sum::<usize>()
    }

    /// Encodes the frame as a RESP array of bulk strings.
    pub fn to_resp(&self) -> RespValue {
        RespValue::Array(self.0.iter().cloned().map(RespValue::BulkString).collect())
    }
}

fn type_char(value: &RespValue) -> char {
    match value {
        RespValue::SimpleString(_) => '+',
        RespValue::Error(_) => '-',
        RespValue::Integer(_) => ':',
        RespValue::BulkString(_) | RespValue::Null => '$',
        RespValue::Boolean(_) => '#',
        RespValue::Double(_) => ',',
        RespValue::BigNumber(_) => '(',
        RespValue::BulkError(_) => '!',
        RespValue::Verbatim { .. } => '=',
        RespValue::Array(_) => '*',
        RespValue::Map(_) => '%',
    }
}

impl TryFrom<RespValue> for Frame {
    type Error = FrameError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        let elements = match value {
            RespValue::Array(elements) => elements,
            other => return Err(FrameError::NotAnArray(type_char(&other))),
        };

        let parts = elements
            .into_iter()
            .map(|element| match element {
                RespValue::BulkString(data) => Ok(data),
                other => Err(FrameError::NotABulkString(type_char(&other))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Frame::new(parts).ok_or(FrameError::Empty)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", String::from_utf8_lossy(part))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::from_strs(&["SeT", "k", "v"]);
        assert_eq!(frame.name(), &Bytes::from("SeT"));
        assert_eq!(frame.command_name(), "set");
        assert_eq!(frame.args(), &[Bytes::from("k"), Bytes::from("v")]);
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.to_string(), "SeT k v");
    }

    #[test]
    #[should_panic(expected = "a frame needs a command name")]
    fn test_from_strs_rejects_empty() {
        Frame::from_strs(&[]);
    }

    #[test]
    fn test_new_rejects_empty() {
        assert_eq!(Frame::new(Vec::new()), None);
        assert!(Frame::new(vec![Bytes::from("PING")]).is_some());
    }

    #[test]
    fn test_encoded_len_matches_resp() {
        let frame = Frame::from_strs(&["SET", "key", "a much longer value here"]);
        assert_eq!(frame.encoded_len(), frame.to_resp().serialize().len());
    }

    #[test]
    fn test_try_from_resp() {
        let value = RespValue::array(vec![RespValue::bulk_string("PING")]);
        assert_eq!(Frame::try_from(value), Ok(Frame::from_strs(&["PING"])));

        assert_eq!(
            Frame::try_from(RespValue::simple_string("PING")),
            Err(FrameError::NotAnArray('+'))
        );
        assert_eq!(
            Frame::try_from(RespValue::array(vec![RespValue::integer(1)])),
            Err(FrameError::NotABulkString(':'))
        );
        assert_eq!(
            Frame::try_from(RespValue::array(vec![])),
            Err(FrameError::Empty)
        );
    }
}
