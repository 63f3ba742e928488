//! Storage Module
//!
//! The in-memory keyspace and the machinery that keeps it tidy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │               CommandSynchronizer worker thread             │
//! │                                                             │
//! │   ┌─────────────────────────────────────────────────────┐   │
//! │   │ Store                                               │   │
//! │   │   HashMap<Bytes, Entry>   Arc<dyn Clock>            │   │
//! │   └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │ Command::PurgeExpired
//!              ┌─────────────┴─────────────┐
//!              │     ExpirySweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! - **Single owner**: the store is moved into the synchronizer's worker and
//!   only ever touched through `&mut Store` inside a command
//! - **Lazy Expiry**: expired keys are evicted when a read touches them
//! - **Active Expiry**: the sweeper periodically schedules a purge
//! - **Injectable Clock**: expiry decisions go through [`Clock`]
//!
//! ## Example
//!
//! ```
//! use ferrokv::storage::{ManualClock, SetExpiry, Store};
//! use bytes::Bytes;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let clock = Arc::new(ManualClock::starting_now());
//! let mut store = Store::new(clock.clone());
//!
//! let expires = store.now() + Duration::from_millis(10);
//! store.set(Bytes::from("session"), Bytes::from("token"), SetExpiry::At(expires));
//! assert!(store.get(b"session").is_some());
//!
//! clock.advance(Duration::from_millis(11));
//! assert!(store.get(b"session").is_none());
//! ```

pub mod clock;
pub mod expiry;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use expiry::{ExpiryConfig, ExpirySweeper};
pub use store::{Entry, SetExpiry, Snapshot, Store};
