//! Replica-side replication.
//!
//! A node starts as a master. `REPLICAOF host port` (or `--replicaof`) turns
//! it into a replica: a background link task performs the handshake, loads
//! the master's snapshot and then applies the master's command stream
//! through the same builder and synchronizer that clients use.
//!
//! ```text
//!   master ──TCP──> link task ──Frame──> CommandFactory (Origin::Master)
//!                                             │
//!                                             ▼
//!                                     CommandSynchronizer
//! ```
//!
//! `REPLICAOF NO ONE` aborts the link and promotes the node back to master,
//! keeping whatever data it has.

pub mod replica;

use crate::config::MasterAddr;
use crate::connection::ReadError;
use crate::persistence::RdbError;
use crate::server::ServerContext;
use crate::sync::SyncError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::info;

/// What this node currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica,
}

impl Role {
    /// Name reported by `INFO replication`.
    pub fn info_name(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Replica => "slave",
        }
    }
}

/// Progress of the link to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not replicating
    Idle,
    /// Connecting and handshaking
    Connecting,
    /// Receiving the snapshot
    Sync,
    /// Applying the command stream
    Connected,
    /// The link ended; nothing is being applied
    Failed,
}

impl LinkState {
    pub fn is_up(self) -> bool {
        self == LinkState::Connected
    }

    pub fn is_syncing(self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::Sync)
    }
}

/// Point-in-time view for `INFO replication`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub role: Role,
    pub master: Option<MasterAddr>,
    pub link: LinkState,
    /// Bytes of the master's stream applied so far
    pub offset: u64,
    pub replication_id: Option<String>,
}

/// Errors that end a replication link.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("replication needs a running async runtime")]
    NoRuntime,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reading from master: {0}")]
    Read(#[from] ReadError),

    #[error("unexpected reply to {step}: {reply}")]
    UnexpectedReply { step: &'static str, reply: String },

    #[error("invalid snapshot header from master: {0}")]
    SnapshotHeader(String),

    #[error("loading master snapshot: {0}")]
    Rdb(#[from] RdbError),

    #[error("command synchronizer unavailable: {0}")]
    Sync(#[from] SyncError),
}

#[derive(Debug)]
struct State {
    master: Option<MasterAddr>,
    link: LinkState,
    offset: u64,
    replication_id: Option<String>,
    /// Bumped whenever the link is replaced so a stale task cannot report
    generation: u64,
    task: Option<JoinHandle<()>>,
}

/// Owns the replica link and its status.
#[derive(Debug)]
pub struct ReplicationManager {
    runtime: Option<Handle>,
    state: Mutex<State>,
}

impl ReplicationManager {
    /// Captures the current tokio runtime, if any, for spawning link tasks.
    ///
    /// `REPLICAOF` runs on the synchronizer's worker thread, which is not a
    /// runtime thread, so the handle has to be taken up front.
    pub fn new() -> Self {
        Self::with_runtime(Handle::try_current().ok())
    }

    pub fn with_runtime(runtime: Option<Handle>) -> Self {
        Self {
            runtime,
            state: Mutex::new(State {
                master: None,
                link: LinkState::Idle,
                offset: 0,
                replication_id: None,
                generation: 0,
                task: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_replica(&self) -> bool {
        self.lock().master.is_some()
    }

    pub fn status(&self) -> ReplicationStatus {
        let state = self.lock();
        ReplicationStatus {
            role: if state.master.is_some() {
                Role::Replica
            } else {
                Role::Master
            },
            master: state.master.clone(),
            link: state.link,
            offset: state.offset,
            replication_id: state.replication_id.clone(),
        }
    }

    /// Starts replicating from `master`, replacing any existing link.
    pub fn replicate_from(
        &self,
        master: MasterAddr,
        ctx: Arc<ServerContext>,
    ) -> Result<(), ReplicationError> {
        let runtime = self.runtime.as_ref().ok_or(ReplicationError::NoRuntime)?;

        let mut state = self.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation += 1;
        state.master = Some(master.clone());
        state.link = LinkState::Connecting;
        state.offset = 0;
        state.replication_id = None;

        info!(master = %master, "Replicating from master");
        state.task = Some(runtime.spawn(replica::run(ctx, master, state.generation)));
        Ok(())
    }

    /// Drops the link and serves as a master again.
    pub fn promote(&self) {
        let mut state = self.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation += 1;
        state.master = None;
        state.link = LinkState::Idle;
        state.offset = 0;
        state.replication_id = None;
    }

    /// Applies `update` if `generation` is still the live link.
    fn update(&self, generation: u64, update: impl FnOnce(&mut State)) {
        let mut state = self.lock();
        if state.generation == generation {
            update(&mut state);
        }
    }

    pub(crate) fn set_link_state(&self, generation: u64, link: LinkState) {
        self.update(generation, |state| state.link = link);
    }

    pub(crate) fn synced(&self, generation: u64, replication_id: String, offset: u64) {
        self.update(generation, |state| {
            state.link = LinkState::Connected;
            state.replication_id = Some(replication_id);
            state.offset = offset;
        });
    }

    pub(crate) fn set_offset(&self, generation: u64, offset: u64) {
        self.update(generation, |state| state.offset = offset);
    }
}

impl Default for ReplicationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        if let Some(task) = self.lock().task.take() {
            task.abort();
        }
    }
}
