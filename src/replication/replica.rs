//! The link to a master.
//!
//! ```text
//!  replica                              master
//!     │ PING                               │
//!     │ ─────────────────────────────────> │ +PONG
//!     │ REPLCONF listening-port <port>     │
//!     │ ─────────────────────────────────> │ +OK
//!     │ REPLCONF capa psync2               │
//!     │ ─────────────────────────────────> │ +OK
//!     │ PSYNC ? -1                         │
//!     │ ─────────────────────────────────> │ +FULLRESYNC <id> <offset>
//!     │                                    │ $<len>\r\n<snapshot>
//!     │ <───────────────────────────────── │ command stream ...
//! ```
//!
//! The snapshot has no trailing CRLF. Commands from the stream run without
//! replies, except `REPLCONF GETACK` which is answered with the number of
//! stream bytes applied before it.

use crate::commands::{Command, Origin};
use crate::config::MasterAddr;
use crate::connection::FrameReader;
use crate::persistence::rdb;
use crate::protocol::{Frame, RespValue};
use crate::replication::{LinkState, ReplicationError};
use crate::server::ServerContext;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Runs one link until it fails or the master goes away.
pub(crate) async fn run(ctx: Arc<ServerContext>, master: MasterAddr, generation: u64) {
    match replicate(&ctx, &master, generation).await {
        Ok(()) => info!(master = %master, "Master closed the replication link"),
        Err(e) => error!(master = %master, error = %e, "Replication link failed"),
    }
    ctx.replication.set_link_state(generation, LinkState::Failed);
}

async fn replicate(
    ctx: &Arc<ServerContext>,
    master: &MasterAddr,
    generation: u64,
) -> Result<(), ReplicationError> {
    let stream = TcpStream::connect((master.host.as_str(), master.port)).await?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(master = %master, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let mut link = MasterLink::new(read_half, write_half);

    let (replication_id, offset) = link.handshake(ctx.config.port).await?;
    ctx.replication.set_link_state(generation, LinkState::Sync);
    info!(master = %master, id = %replication_id, offset = offset, "Full resync accepted");

    let payload = link.read_snapshot().await?;
    let snapshot = rdb::decode(&payload, ctx.clock.now())?;
    let keys = snapshot.len();
    ctx.synchronizer
        .post_and_wait(vec![Command::Restore(snapshot)])
        .await?;
    ctx.replication.synced(generation, replication_id, offset);
    info!(master = %master, keys = keys, "Loaded master snapshot");

    link.stream(ctx, generation, offset).await
}

/// Both halves of the connection to the master.
struct MasterLink<R, W> {
    reader: FrameReader<R>,
    writer: BufWriter<W>,
}

impl<R, W> MasterLink<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    async fn send(&mut self, parts: &[&str]) -> Result<(), ReplicationError> {
        let bytes = Frame::from_strs(parts).to_resp().serialize();
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Sends `parts` and returns the simple string reply.
    async fn request(
        &mut self,
        step: &'static str,
        parts: &[&str],
    ) -> Result<String, ReplicationError> {
        self.send(parts).await?;
        match self.reader.read_value().await? {
            RespValue::SimpleString(reply) => Ok(reply),
            other => Err(ReplicationError::UnexpectedReply {
                step,
                reply: format!("{:?}", other),
            }),
        }
    }

    async fn expect(
        &mut self,
        step: &'static str,
        parts: &[&str],
        expected: &str,
    ) -> Result<(), ReplicationError> {
        let reply = self.request(step, parts).await?;
        if reply.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(ReplicationError::UnexpectedReply { step, reply })
        }
    }

    /// Runs the handshake and returns the master's replication id and offset.
    async fn handshake(&mut self, listening_port: u16) -> Result<(String, u64), ReplicationError> {
        self.expect("PING", &["PING"], "PONG").await?;
        let port = listening_port.to_string();
        self.expect(
            "REPLCONF listening-port",
            &["REPLCONF", "listening-port", port.as_str()],
            "OK",
        )
        .await?;
        self.expect("REPLCONF capa", &["REPLCONF", "capa", "psync2"], "OK")
            .await?;

        let reply = self.request("PSYNC", &["PSYNC", "?", "-1"]).await?;
        parse_full_resync(&reply).ok_or(ReplicationError::UnexpectedReply {
            step: "PSYNC",
            reply,
        })
    }

    /// Reads `$<len>\r\n` followed by `len` raw bytes.
    async fn read_snapshot(&mut self) -> Result<bytes::Bytes, ReplicationError> {
        let header = self.reader.read_line().await?;
        let header = String::from_utf8_lossy(&header).into_owned();
        let len = header
            .strip_prefix('$')
            .and_then(|len| len.parse::<usize>().ok())
            .filter(|&len| len <= crate::connection::MAX_FRAME_SIZE)
            .ok_or(ReplicationError::SnapshotHeader(header))?;
        Ok(self.reader.read_exact_bytes(len).await?)
    }

    /// Applies the command stream, starting at `offset`.
    async fn stream(
        &mut self,
        ctx: &Arc<ServerContext>,
        generation: u64,
        mut offset: u64,
    ) -> Result<(), ReplicationError> {
        let factory = ctx.factory();

        loop {
            let frames = match self.reader.read_batch().await? {
                Some(frames) => frames,
                None => return Ok(()),
            };

            let mut pending = Vec::new();
            let mut pending_len = 0u64;
            let mut unacked = false;

            for frame in &frames {
                if is_getack(frame) {
                    offset += apply(ctx, std::mem::take(&mut pending), pending_len).await?;
                    pending_len = 0;
                    ctx.replication.set_offset(generation, offset);
                    self.ack(offset).await?;
                    unacked = false;
                    offset += frame.encoded_len() as u64;
                    continue;
                }

                pending_len += frame.encoded_len() as u64;
                unacked = true;
                match factory.build(frame, &Origin::Master) {
                    Ok(command) => pending.push(command),
                    Err(e) => {
                        warn!(command = %frame.command_name(), error = %e, "Skipping command from master")
                    }
                }
            }

            offset += apply(ctx, pending, pending_len).await?;
            ctx.replication.set_offset(generation, offset);
            if unacked {
                self.ack(offset).await?;
            }
        }
    }

    async fn ack(&mut self, offset: u64) -> Result<(), ReplicationError> {
        let offset = offset.to_string();
        self.send(&["REPLCONF", "ACK", offset.as_str()]).await
    }
}

/// Runs `commands` and returns `len`, the stream bytes they came from.
async fn apply(
    ctx: &ServerContext,
    commands: Vec<Command>,
    len: u64,
) -> Result<u64, ReplicationError> {
    if !commands.is_empty() {
        for reply in ctx.synchronizer.post_and_wait(commands).await? {
            if let RespValue::Error(message) = reply {
                debug!(error = %message, "Command from master failed");
            }
        }
    }
    Ok(len)
}

fn is_getack(frame: &Frame) -> bool {
    frame.name().eq_ignore_ascii_case(b"replconf")
        && frame
            .args()
            .first()
            .is_some_and(|sub| sub.eq_ignore_ascii_case(b"getack"))
}

/// Parses `FULLRESYNC <id> <offset>`.
fn parse_full_resync(reply: &str) -> Option<(String, u64)> {
    let mut parts = reply.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(keyword), Some(id), Some(offset), None)
            if keyword.eq_ignore_ascii_case("FULLRESYNC") =>
        {
            Some((id.to_string(), offset.parse().ok()?))
        }
        _ => None,
    }
}
