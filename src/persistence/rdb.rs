//! Snapshot file codec.
//!
//! A subset of the Redis RDB format: string values only, database 0 only.
//!
//! ```text
//! "REDIS" "0011"                        magic + 4-digit version
//! 0xFA <string> <string>                aux field (skipped on load)
//! 0xFE <length=0>                       select db 0
//! 0xFB <length> <length>                keyspace size, keys with expiry
//! [0xFC <u64 LE ms> | 0xFD <u32 LE s>]  optional expiry
//! 0x00 <string key> <string value>      one entry
//! ...
//! 0xFF <8 byte checksum>                end; written as zeros (disabled)
//! ```
//!
//! Lengths use one fixed scheme:
//!
//! | First byte  | Meaning                                  |
//! |-------------|------------------------------------------|
//! | `00xxxxxx`  | 6-bit length                             |
//! | `01xxxxxx`  | 14-bit length, next byte is the low part |
//! | `0x80`      | 32-bit big-endian length follows         |
//! | `0x81`      | 64-bit big-endian length follows         |
//! | `11xxxxxx`  | special string encoding (load only)      |
//!
//! Special string encodings `0xC0`, `0xC1` and `0xC2` hold 8, 16 and 32 bit
//! little-endian integers. LZF-compressed strings (`0xC3`) are rejected.

use crate::storage::{Entry, Snapshot};
use bytes::{Buf, BufMut, Bytes};
use std::time::SystemTime;
use thiserror::Error;

use crate::storage::clock::{from_unix_millis, to_unix_millis};

const MAGIC: &[u8] = b"REDIS";
const VERSION: u32 = 11;
/// Newest format version accepted on load
const MAX_VERSION: u32 = 12;

mod opcode {
    pub const AUX: u8 = 0xFA;
    pub const RESIZE_DB: u8 = 0xFB;
    pub const EXPIRE_TIME_MS: u8 = 0xFC;
    pub const EXPIRE_TIME: u8 = 0xFD;
    pub const SELECT_DB: u8 = 0xFE;
    pub const EOF: u8 = 0xFF;
    pub const STRING: u8 = 0x00;
}

const LEN_6BIT: u8 = 0b00;
const LEN_14BIT: u8 = 0b01;
const LEN_32BIT: u8 = 0x80;
const LEN_64BIT: u8 = 0x81;
const ENC_INT8: u8 = 0;
const ENC_INT16: u8 = 1;
const ENC_INT32: u8 = 2;
const ENC_LZF: u8 = 3;

/// Errors reading a snapshot.
#[derive(Debug, Error, PartialEq)]
pub enum RdbError {
    #[error("not an RDB file")]
    BadMagic,

    #[error("unsupported RDB version {0}")]
    UnsupportedVersion(u32),

    #[error("unexpected end of RDB file")]
    UnexpectedEof,

    #[error("invalid length encoding {0:#04x}")]
    BadLength(u8),

    #[error("unsupported string encoding {0}")]
    UnsupportedEncoding(u8),

    #[error("unsupported value type {0:#04x}")]
    UnsupportedValueType(u8),

    #[error("only database 0 is supported, found {0}")]
    UnsupportedDatabase(u64),
}

/// Encodes every entry of `snapshot` still live at `now`.
pub fn encode(snapshot: &Snapshot, now: SystemTime) -> Vec<u8> {
    let live: Vec<(&Bytes, &Entry)> = snapshot
        .iter()
        .filter(|(_, entry)| entry.is_live(now))
        .collect();
    let volatile = live
        .iter()
        .filter(|(_, entry)| entry.expires_at.is_some())
        .count();

    let mut buf = Vec::with_capacity(64 + live.len() * 32);
    buf.put_slice(MAGIC);
    buf.put_slice(format!("{:04}", VERSION).as_bytes());

    buf.put_u8(opcode::AUX);
    write_string(&mut buf, b"redis-ver");
    write_string(&mut buf, crate::REDIS_COMPAT_VERSION.as_bytes());

    buf.put_u8(opcode::SELECT_DB);
    write_length(&mut buf, 0);
    buf.put_u8(opcode::RESIZE_DB);
    write_length(&mut buf, live.len() as u64);
    write_length(&mut buf, volatile as u64);

    for (key, entry) in live {
        if let Some(at) = entry.expires_at {
            buf.put_u8(opcode::EXPIRE_TIME_MS);
            buf.put_u64_le(to_unix_millis(at));
        }
        buf.put_u8(opcode::STRING);
        write_string(&mut buf, key);
        write_string(&mut buf, &entry.value);
    }

    buf.put_u8(opcode::EOF);
    buf.put_u64_le(0);
    buf
}

/// Decodes a snapshot, dropping entries that expired before `now`.
pub fn decode(data: &[u8], now: SystemTime) -> Result<Snapshot, RdbError> {
    let mut buf = data;

    if take(&mut buf, MAGIC.len())? != MAGIC {
        return Err(RdbError::BadMagic);
    }
    let version = std::str::from_utf8(take(&mut buf, 4)?)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or(RdbError::BadMagic)?;
    if version > MAX_VERSION {
        return Err(RdbError::UnsupportedVersion(version));
    }

    let mut snapshot = Snapshot::new();
    loop {
        let mut op = take_u8(&mut buf)?;
        let mut expires_at = None;

        match op {
            opcode::EOF => break,
            opcode::AUX => {
                read_string(&mut buf)?;
                read_string(&mut buf)?;
                continue;
            }
            opcode::SELECT_DB => {
                let db = read_length(&mut buf)?;
                if db != 0 {
                    return Err(RdbError::UnsupportedDatabase(db));
                }
                continue;
            }
            opcode::RESIZE_DB => {
                let size = read_length(&mut buf)?;
                read_length(&mut buf)?;
                snapshot.reserve(size.min(1 << 20) as usize);
                continue;
            }
            opcode::EXPIRE_TIME_MS => {
                ensure(&buf, 8)?;
                expires_at = Some(from_unix_millis(buf.get_u64_le()));
                op = take_u8(&mut buf)?;
            }
            opcode::EXPIRE_TIME => {
                ensure(&buf, 4)?;
                expires_at = Some(from_unix_millis(u64::from(buf.get_u32_le()) * 1000));
                op = take_u8(&mut buf)?;
            }
            _ => {}
        }

        if op != opcode::STRING {
            return Err(RdbError::UnsupportedValueType(op));
        }
        let key = read_string(&mut buf)?;
        let value = read_string(&mut buf)?;
        let entry = Entry { value, expires_at };
        if entry.is_live(now) {
            snapshot.insert(key, entry);
        }
    }

    Ok(snapshot)
}

fn ensure(buf: &&[u8], n: usize) -> Result<(), RdbError> {
    if buf.remaining() < n {
        Err(RdbError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], RdbError> {
    ensure(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, RdbError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn write_length(buf: &mut Vec<u8>, len: u64) {
    if len < 1 << 6 {
        buf.put_u8((LEN_6BIT << 6) | len as u8);
    } else if len < 1 << 14 {
        buf.put_u8((LEN_14BIT << 6) | (len >> 8) as u8);
        buf.put_u8(len as u8);
    } else if len <= u64::from(u32::MAX) {
        buf.put_u8(LEN_32BIT);
        buf.put_u32(len as u32);
    } else {
        buf.put_u8(LEN_64BIT);
        buf.put_u64(len);
    }
}

/// A decoded length prefix.
enum Length {
    Plain(u64),
    Special(u8),
}

fn read_length_or_encoding(buf: &mut &[u8]) -> Result<Length, RdbError> {
    let first = take_u8(buf)?;
    match first >> 6 {
        0b00 => Ok(Length::Plain(u64::from(first & 0x3F))),
        0b01 => {
            let low = take_u8(buf)?;
            Ok(Length::Plain((u64::from(first & 0x3F) << 8) | u64::from(low)))
        }
        0b10 => match first {
            LEN_32BIT => {
                ensure(buf, 4)?;
                Ok(Length::Plain(u64::from(buf.get_u32())))
            }
            LEN_64BIT => {
                ensure(buf, 8)?;
                Ok(Length::Plain(buf.get_u64()))
            }
            other => Err(RdbError::BadLength(other)),
        },
        _ => Ok(Length::Special(first & 0x3F)),
    }
}

fn read_length(buf: &mut &[u8]) -> Result<u64, RdbError> {
    match read_length_or_encoding(buf)? {
        Length::Plain(len) => Ok(len),
        Length::Special(enc) => Err(RdbError::BadLength(0xC0 | enc)),
    }
}

fn write_string(buf: &mut Vec<u8>, data: &[u8]) {
    write_length(buf, data.len() as u64);
    buf.put_slice(data);
}

fn read_string(buf: &mut &[u8]) -> Result<Bytes, RdbError> {
    match read_length_or_encoding(buf)? {
        Length::Plain(len) => {
            let len = usize::try_from(len).map_err(|_| RdbError::UnexpectedEof)?;
            Ok(Bytes::copy_from_slice(take(buf, len)?))
        }
        Length::Special(ENC_INT8) => {
            ensure(buf, 1)?;
            Ok(Bytes::from(buf.get_i8().to_string()))
        }
        Length::Special(ENC_INT16) => {
            ensure(buf, 2)?;
            Ok(Bytes::from(buf.get_i16_le().to_string()))
        }
        Length::Special(ENC_INT32) => {
            ensure(buf, 4)?;
            Ok(Bytes::from(buf.get_i32_le().to_string()))
        }
        Length::Special(ENC_LZF) => Err(RdbError::UnsupportedEncoding(ENC_LZF)),
        Length::Special(other) => Err(RdbError::UnsupportedEncoding(other)),
    }
}
