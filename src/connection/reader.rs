//! Pipelined frame reader.
//!
//! TCP is a byte stream: one read may hold half a command, or a dozen. The
//! reader keeps one growable buffer per connection and only ever hands out
//! whole frames. A partial tail stays buffered until the rest arrives.
//!
//! ```text
//!  socket ──read_buf──> [ consumed | frame | frame | partial.. | spare ]
//!                        ^split_to                  ^kept for next call
//! ```
//!
//! After each blocking read the reader drains whatever else the socket
//! already has without waiting, so a client that pipelines gets its whole
//! burst executed as one batch.

use crate::protocol::{Frame, ParseError, RespParser, RespValue};
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// The buffer never grows past this; a frame that does not fit is refused.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 * 1024;

/// Errors reading frames from a transport.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The peer reset or aborted the connection
    #[error("connection reset by peer")]
    Reset,

    /// Any other transport failure
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// The bytes are not a valid request
    #[error("{0}")]
    Protocol(String),

    /// A single frame outgrew the buffer limit
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    /// The stream ended inside a frame
    #[error("connection closed in the middle of a frame")]
    UnexpectedEof,
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ReadError::Reset,
            _ => ReadError::Io(e),
        }
    }
}

impl From<ParseError> for ReadError {
    fn from(e: ParseError) -> Self {
        ReadError::Protocol(e.to_string())
    }
}

/// Reads batches of whole frames from `R`.
#[derive(Debug)]
pub struct FrameReader<R> {
    stream: R,
    buffer: BytesMut,
    parser: RespParser,
    /// Protocol error found behind good frames, reported on the next call
    deferred: Option<ReadError>,
    /// The peer closed the stream during a non-blocking drain
    eof: bool,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self::from_parts(stream, Bytes::new())
    }

    /// Creates a reader whose buffer already holds `leftover`, for streams
    /// where some bytes were consumed by an earlier exchange.
    pub fn from_parts(stream: R, leftover: Bytes) -> Self {
        let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE.max(leftover.len()));
        buffer.extend_from_slice(&leftover);
        Self {
            stream,
            buffer,
            parser: RespParser::new(),
            deferred: None,
            eof: false,
            bytes_read: 0,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.stream
    }

    /// Total bytes read from the transport.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Splits the reader into its stream and the unconsumed bytes.
    pub fn into_parts(self) -> (R, Bytes) {
        (self.stream, self.buffer.freeze())
    }

    /// Returns the next batch of whole frames.
    ///
    /// Waits until at least one frame is buffered. `Ok(None)` means the
    /// peer closed the stream cleanly between frames.
    pub async fn read_batch(&mut self) -> Result<Option<Vec<Frame>>, ReadError> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }

        loop {
            let frames = self.parse_frames()?;
            if !frames.is_empty() {
                return Ok(Some(frames));
            }

            if self.eof {
                return self.end_of_stream();
            }

            if self.fill().await? == 0 {
                return self.end_of_stream();
            }
            self.drain();
        }
    }

    /// Reads raw bytes until `n` are buffered, then takes them.
    ///
    /// Used for payloads that are not RESP frames, such as the snapshot a
    /// master sends during a full sync.
    pub async fn read_exact_bytes(&mut self, n: usize) -> Result<Bytes, ReadError> {
        while self.buffer.len() < n {
            if self.eof || self.fill().await? == 0 {
                return Err(ReadError::UnexpectedEof);
            }
        }
        Ok(self.buffer.split_to(n).freeze())
    }

    /// Reads up to and including the next CRLF and returns the line without it.
    pub async fn read_line(&mut self) -> Result<Bytes, ReadError> {
        loop {
            if let Some(pos) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                let line = self.buffer.split_to(pos).freeze();
                let _ = self.buffer.split_to(2);
                return Ok(line);
            }
            if self.eof || self.fill().await? == 0 {
                return Err(ReadError::UnexpectedEof);
            }
        }
    }

    /// Reads one RESP value, whatever its type.
    pub async fn read_value(&mut self) -> Result<RespValue, ReadError> {
        loop {
            if let Some((value, consumed)) = self.parser.parse(&self.buffer)? {
                let _ = self.buffer.split_to(consumed);
                return Ok(value);
            }
            if self.eof || self.fill().await? == 0 {
                return Err(ReadError::UnexpectedEof);
            }
        }
    }

    fn end_of_stream(&mut self) -> Result<Option<Vec<Frame>>, ReadError> {
        if self.buffer.is_empty() {
            Ok(None)
        } else {
            Err(ReadError::UnexpectedEof)
        }
    }

    /// Parses every whole frame at the front of the buffer.
    ///
    /// A bad frame behind good ones is deferred so the good ones still run.
    fn parse_frames(&mut self) -> Result<Vec<Frame>, ReadError> {
        let mut frames = Vec::new();

        loop {
            match self.next_frame() {
                Ok(Some(Some(frame))) => frames.push(frame),
                // Empty multibulk, nothing to run
                Ok(Some(None)) => continue,
                Ok(None) => break,
                Err(e) if frames.is_empty() => return Err(e),
                Err(e) => {
                    self.deferred = Some(e);
                    break;
                }
            }
        }

        if !frames.is_empty() {
            trace!(
                frames = frames.len(),
                remaining = self.buffer.len(),
                "Parsed frames"
            );
        }
        Ok(frames)
    }

    /// `Ok(None)`: incomplete. `Ok(Some(None))`: an empty request was skipped.
    fn next_frame(&mut self) -> Result<Option<Option<Frame>>, ReadError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        if self.buffer[0] != b'*' {
            return Err(ReadError::Protocol(format!(
                "expected '*', got '{}'",
                self.buffer[0] as char
            )));
        }

        let (value, consumed) = match self.parser.parse(&self.buffer)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };
        let _ = self.buffer.split_to(consumed);

        match value {
            // *0 and *-1
            RespValue::Null => Ok(Some(None)),
            RespValue::Array(ref elements) if elements.is_empty() => Ok(Some(None)),
            value => Frame::try_from(value)
                .map(|frame| Some(Some(frame)))
                .map_err(|e| ReadError::Protocol(e.to_string())),
        }
    }

    /// Makes room for the next read, doubling up to [`MAX_FRAME_SIZE`].
    fn reserve(&mut self) -> Result<(), ReadError> {
        if self.buffer.len() < self.buffer.capacity() {
            return Ok(());
        }
        if self.buffer.len() >= MAX_FRAME_SIZE {
            return Err(ReadError::FrameTooLarge {
                max: MAX_FRAME_SIZE,
            });
        }
        let target = (self.buffer.capacity() * 2)
            .max(INITIAL_BUFFER_SIZE)
            .min(MAX_FRAME_SIZE);
        self.buffer.reserve(target - self.buffer.len());
        Ok(())
    }

    /// One blocking read.
    async fn fill(&mut self) -> Result<usize, ReadError> {
        self.reserve()?;
        let n = self.stream.read_buf(&mut self.buffer).await?;
        self.bytes_read += n as u64;
        if n == 0 {
            self.eof = true;
        }
        trace!(bytes = n, buffered = self.buffer.len(), "Read data");
        Ok(n)
    }

    /// Takes whatever is already readable without waiting.
    fn drain(&mut self) {
        loop {
            if self.reserve().is_err() {
                return;
            }
            match self.stream.read_buf(&mut self.buffer).now_or_never() {
                Some(Ok(0)) => {
                    self.eof = true;
                    return;
                }
                Some(Ok(n)) => self.bytes_read += n as u64,
                // The error resurfaces on the next blocking read
                Some(Err(_)) | None => return,
            }
        }
    }
}
