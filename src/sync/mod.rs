//! Command Synchronizer
//!
//! Every command from every connection, from the replication link and from
//! the expiry sweeper funnels through one bounded queue into one worker
//! thread that owns the [`Store`](crate::storage::Store).
//!
//! ```text
//!  Session A ──┐
//!  Session B ──┤   post / post_and_wait    ┌──────────────────────────┐
//!  Replica   ──┼──────────────────────────>│ bounded mpsc (FIFO)      │
//!  Sweeper   ──┘     (await when full)     └────────────┬─────────────┘
//!                                                       │ blocking_recv
//!                                                       ▼
//!                                      ┌──────────────────────────────┐
//!                                      │ worker thread                │
//!                                      │   reply = cmd.execute(store) │
//!                                      │   callback(reply)            │
//!                                      └──────────────────────────────┘
//! ```
//!
//! At most one command touches the store at any instant and commands run in
//! the order they were enqueued, so no per-key locking exists anywhere.

pub mod synchronizer;

pub use synchronizer::{Callback, CommandSynchronizer, Executable, SyncError, SyncState};
