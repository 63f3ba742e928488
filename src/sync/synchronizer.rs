//! The single-worker command executor.
//!
//! ## Lifecycle
//!
//! ```text
//!  NotStarted ──start()──> Running ──stop()──> Stopped
//!       │                                        ▲
//!       └───────────────── stop() ───────────────┘ (error: NotRunning)
//! ```
//!
//! `start()` succeeds exactly once. A second call returns
//! [`SyncError::AlreadyStarted`]; callers treat that as fatal since it means
//! two parts of the program believe they own the store.
//!
//! `stop()` closes the queue to new submissions, lets the worker finish
//! everything already queued, joins it and hands the store back. A waiter
//! whose command can no longer run observes [`SyncError::Cancelled`].

use crate::protocol::RespValue;
use crate::storage::Store;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Default depth of the submission queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Something the worker can run against the store.
pub trait Executable: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Runs against the store. Only ever called on the worker thread.
    fn execute(self, store: &mut Store) -> RespValue;
}

/// Receives the result of one command, exactly once.
pub type Callback = Box<dyn FnOnce(RespValue) + Send>;

/// A queued command and the callback waiting for its result.
struct PendingReply<C> {
    command: C,
    callback: Callback,
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    NotStarted,
    Running,
    Stopped,
}

enum Lifecycle<C> {
    NotStarted {
        store: Store,
        queue: mpsc::Receiver<PendingReply<C>>,
    },
    Running {
        worker: JoinHandle<Store>,
    },
    Stopped,
}

/// Errors reported by the synchronizer.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("command synchronizer already started")]
    AlreadyStarted,

    #[error("command synchronizer is not running")]
    NotRunning,

    #[error("command synchronizer is stopped")]
    Stopped,

    #[error("command was cancelled before it executed")]
    Cancelled,

    #[error("failed to spawn synchronizer worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("synchronizer worker panicked")]
    WorkerPanicked,
}

/// Serializes command execution onto one worker thread.
pub struct CommandSynchronizer<C = crate::commands::Command> {
    /// Submission side of the queue. `None` once stopped.
    sender: Mutex<Option<mpsc::Sender<PendingReply<C>>>>,
    lifecycle: Mutex<Lifecycle<C>>,
}

impl<C: Executable> std::fmt::Debug for CommandSynchronizer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSynchronizer")
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Executable> CommandSynchronizer<C> {
    /// Creates a synchronizer that will own `store` once started.
    ///
    /// `capacity` bounds the queue; producers wait when it is full.
    pub fn new(store: Store, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
            lifecycle: Mutex::new(Lifecycle::NotStarted { store, queue: rx }),
        }
    }

    /// Spawns the worker thread.
    pub fn start(&self) -> Result<(), SyncError> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);

        let (store, queue) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::NotStarted { store, queue } => (store, queue),
            other => {
                *lifecycle = other;
                return Err(SyncError::AlreadyStarted);
            }
        };

        let worker = std::thread::Builder::new()
            .name("command-synchronizer".to_string())
            .spawn(move || run_worker(store, queue))?;

        *lifecycle = Lifecycle::Running { worker };
        info!("Command synchronizer started");
        Ok(())
    }

    /// Stops accepting commands, drains the queue and returns the store.
    ///
    /// Blocks until the worker exits; call from a blocking context.
    pub fn stop(&self) -> Result<Store, SyncError> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);

        let worker = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { worker } => worker,
            other => {
                *lifecycle = other;
                return Err(SyncError::NotRunning);
            }
        };

        // Dropping the last long-lived sender ends the worker loop once
        // in-flight submissions are drained.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let store = worker.join().map_err(|_| SyncError::WorkerPanicked)?;
        info!(keys = store.len(), "Command synchronizer stopped");
        Ok(store)
    }

    pub fn state(&self) -> SyncState {
        match &*self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) {
            Lifecycle::NotStarted { .. } => SyncState::NotStarted,
            Lifecycle::Running { .. } => SyncState::Running,
            Lifecycle::Stopped => SyncState::Stopped,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<PendingReply<C>>, SyncError> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SyncError::Stopped)
    }

    /// Enqueues one command. `callback` runs on the worker thread with the
    /// result. Waits only if the queue is full.
    pub async fn post(&self, command: C, callback: Callback) -> Result<(), SyncError> {
        let sender = self.sender()?;
        sender
            .send(PendingReply { command, callback })
            .await
            .map_err(|_| SyncError::Stopped)
    }

    /// Enqueues `commands` in order and waits until the last one has run.
    ///
    /// Results come back in submission order.
    pub async fn post_and_wait(&self, commands: Vec<C>) -> Result<Vec<RespValue>, SyncError> {
        let expected = commands.len();
        if expected == 0 {
            return Ok(Vec::new());
        }

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let sender = self.sender()?;

        for command in commands {
            let reply_tx = reply_tx.clone();
            let callback: Callback = Box::new(move |reply| {
                // The waiter may have given up; nothing to do then
                let _ = reply_tx.send(reply);
            });
            sender
                .send(PendingReply { command, callback })
                .await
                .map_err(|_| SyncError::Stopped)?;
        }
        drop(sender);
        drop(reply_tx);

        let mut replies = Vec::with_capacity(expected);
        while let Some(reply) = reply_rx.recv().await {
            replies.push(reply);
        }

        if replies.len() != expected {
            debug!(
                expected = expected,
                received = replies.len(),
                "Batch cancelled before completion"
            );
            return Err(SyncError::Cancelled);
        }
        Ok(replies)
    }
}

fn run_worker<C: Executable>(mut store: Store, mut queue: mpsc::Receiver<PendingReply<C>>) -> Store {
    while let Some(PendingReply { command, callback }) = queue.blocking_recv() {
        let name = command.name();
        let reply = match panic::catch_unwind(AssertUnwindSafe(|| command.execute(&mut store))) {
            Ok(reply) => reply,
            Err(payload) => {
                error!(
                    command = name,
                    panic = %panic_message(payload.as_ref()),
                    "Command panicked during execution"
                );
                RespValue::error("ERR internal error")
            }
        };
        callback(reply);
    }
    store
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
