//! Connection Session
//!
//! One session per client socket. Each turn of the loop handles a whole
//! pipelined batch:
//!
//! ```text
//!    ┌──────────────────────────────┐
//!    │  read_batch()                │  whole frames only
//!    │        │                     │
//!    │        ▼                     │
//!    │  build each frame            │  failures keep their position
//!    │        │                     │
//!    │        ▼                     │
//!    │  post_and_wait(commands)     │  runs on the synchronizer
//!    │        │                     │
//!    │        ▼                     │
//!    │  merge, encode, one write    │  replies in request order
//!    └────────┴─────────────────────┘
//! ```
//!
//! A protocol error gets one `-ERR Protocol error: ...` reply and closes the
//! connection. A reset just ends the session.

use crate::commands::{CommandFactory, Origin};
use crate::connection::reader::{FrameReader, ReadError};
use crate::protocol::RespValue;
use crate::server::ServerContext;
use crate::sync::{CommandSynchronizer, SyncError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn commands_processed(&self, count: usize) {
        self.commands_processed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: u64) {
        self.bytes_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Per-connection identity that commands can read and update.
#[derive(Debug)]
pub struct ClientInfo {
    id: u64,
    addr: Option<SocketAddr>,
    name: Mutex<Option<String>>,
}

impl ClientInfo {
    pub fn new(id: u64, addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            addr,
            name: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn name(&self) -> Option<String> {
        self.name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = name;
    }
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error while writing replies
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Reading frames failed
    #[error("{0}")]
    Read(#[from] ReadError),

    /// The client sent something that is not RESP
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The synchronizer stopped while commands were pending
    #[error("command synchronizer unavailable: {0}")]
    Sync(#[from] SyncError),
}

impl ConnectionError {
    /// True for a peer that simply went away.
    fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::Read(ReadError::Reset) => true,
            ConnectionError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// A client connection and everything needed to serve it.
pub struct Session<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
    client: Arc<ClientInfo>,
    origin: Origin,
    factory: CommandFactory,
    synchronizer: Arc<CommandSynchronizer>,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
    /// Reader byte count already added to `stats`
    reported_read: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(
        stream: S,
        addr: Option<SocketAddr>,
        ctx: &Arc<ServerContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        ctx.stats.connection_opened();

        let client = Arc::new(ClientInfo::new(ctx.next_client_id(), addr));
        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            reader: FrameReader::new(read_half),
            writer: BufWriter::new(write_half),
            origin: Origin::Client(Arc::clone(&client)),
            client,
            factory: ctx.factory(),
            synchronizer: Arc::clone(&ctx.synchronizer),
            stats: Arc::clone(&ctx.stats),
            shutdown,
            reported_read: 0,
        }
    }

    pub fn client(&self) -> &Arc<ClientInfo> {
        &self.client
    }

    /// Serves the connection until the client leaves, errors, or the
    /// server shuts down.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let id = self.client.id();
        let peer = peer_name(self.client.addr());
        info!(client = %peer, id = id, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %peer, id = id, "Client disconnected"),
            Err(e) if e.is_disconnect() => {
                debug!(client = %peer, id = id, "Connection reset by client")
            }
            Err(e) => warn!(client = %peer, id = id, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            let batch = tokio::select! {
                batch = self.reader.read_batch() => batch,
                _ = self.shutdown.changed() => return Ok(()),
            };
            self.report_bytes_read();

            let frames = match batch {
                Ok(Some(frames)) => frames,
                Ok(None) => return Ok(()),
                Err(ReadError::Protocol(detail)) => {
                    let reply = RespValue::error(format!("ERR Protocol error: {}", detail));
                    self.write_replies(&[reply]).await?;
                    return Err(ConnectionError::Protocol(detail));
                }
                Err(e) => return Err(e.into()),
            };

            let replies = self.execute(frames).await?;
            self.write_replies(&replies).await?;
        }
    }

    /// Builds and runs one batch. Replies come back in frame order, with
    /// build failures answered in place.
    async fn execute(
        &mut self,
        frames: Vec<crate::protocol::Frame>,
    ) -> Result<Vec<RespValue>, ConnectionError> {
        let mut slots: Vec<Option<RespValue>> = Vec::with_capacity(frames.len());
        let mut commands = Vec::with_capacity(frames.len());

        for frame in &frames {
            match self.factory.build(frame, &self.origin) {
                Ok(command) => {
                    commands.push(command);
                    slots.push(None);
                }
                Err(e) => {
                    debug!(id = self.client.id(), command = %frame.command_name(), error = %e, "Command rejected");
                    slots.push(Some(e.into()));
                }
            }
        }

        let executed = self.synchronizer.post_and_wait(commands).await?;
        self.stats.commands_processed(frames.len());

        let mut executed = executed.into_iter();
        Ok(slots
            .into_iter()
            .map(|slot| {
                slot.or_else(|| executed.next())
                    .unwrap_or_else(|| RespValue::error("ERR internal error"))
            })
            .collect())
    }

    /// Encodes all replies into one buffer and writes it in one go.
    async fn write_replies(&mut self, replies: &[RespValue]) -> Result<(), ConnectionError> {
        let mut buf = Vec::with_capacity(replies.iter().map(RespValue::encoded_len).sum());
        for reply in replies {
            reply.serialize_into(&mut buf);
        }

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        self.stats.bytes_written(buf.len());
        trace!(id = self.client.id(), bytes = buf.len(), "Sent replies");
        Ok(())
    }

    fn report_bytes_read(&mut self) {
        let total = self.reader.bytes_read();
        self.stats.bytes_read(total - self.reported_read);
        self.reported_read = total;
    }
}

fn peer_name(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "-".to_string(), |addr| addr.to_string())
}

/// Serves one accepted TCP connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
    }
    // Errors are already logged by `run`
    let _ = Session::new(stream, Some(addr), &ctx, shutdown).run().await;
}
