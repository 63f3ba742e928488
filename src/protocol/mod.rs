//! RESP Protocol Implementation
//!
//! This module is the wire codec: pure functions between [`RespValue`] and
//! RESP bytes, with no I/O and no state beyond a nesting counter.
//!
//! ## Modules
//!
//! - `types`: Defines the `RespValue` enum and its encoder
//! - `frame`: The request shape, an array of bulk strings
//! - `parser`: Incremental decoder for incoming RESP data
//!
//! ## Example
//!
//! ```
//! use ferrokv::protocol::{decode, RespValue};
//! use bytes::Bytes;
//!
//! let reply = RespValue::array(vec![
//!     RespValue::bulk_string(Bytes::from("GET")),
//!     RespValue::bulk_string(Bytes::from("name")),
//! ]);
//! let bytes = reply.serialize();
//!
//! let (values, consumed) = decode(&bytes).unwrap();
//! assert_eq!(values, vec![reply]);
//! assert_eq!(consumed, bytes.len());
//! ```

pub mod frame;
pub mod parser;
pub mod types;

pub use frame::{Frame, FrameError};
pub use parser::{decode, parse_message, ParseError, ParseResult, RespParser};
pub use types::RespValue;
