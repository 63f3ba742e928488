//! # FerroKV - A Redis-Compatible Key-Value Server
//!
//! FerroKV speaks RESP over TCP and runs every command on one worker
//! thread that owns the keyspace. Connection tasks only parse, validate and
//! write; they never touch the data.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              FerroKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│  Session    │───>│  Command    │                  │
//! │  │ (Listener)  │    │ FrameReader │    │  Factory    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │ batch of commands       │
//! │  ┌─────────────┐                              ▼                         │
//! │  │ Replica     │───────────────>┌──────────────────────────────┐        │
//! │  │ link        │                │     CommandSynchronizer      │        │
//! │  └─────────────┘                │  one worker thread, owns the │        │
//! │                                 │            Store             │        │
//! │  ┌─────────────┐                └──────────────────────────────┘        │
//! │  │ Expiry      │───PurgeExpired───────────────▲                         │
//! │  │ sweeper     │                                                        │
//! │  └─────────────┘                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use ferrokv::config::Config;
//! use ferrokv::server::{serve, ServerContext};
//! use ferrokv::storage::{Store, SystemClock};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let listener = TcpListener::bind(config.bind_address()).await?;
//!
//!     let ctx = ServerContext::new(config, Arc::new(SystemClock), Store::default());
//!     ctx.synchronizer.start()?;
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     serve(listener, ctx, shutdown_rx).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP values, the incremental parser and request frames
//! - [`connection`]: the pipeline reader and per-client sessions
//! - [`commands`]: building commands from frames and running them
//! - [`sync`]: the single-worker command synchronizer
//! - [`storage`]: the keyspace, clocks and the active expiry sweeper
//! - [`persistence`]: RDB snapshots for `SAVE`, `BGSAVE` and startup
//! - [`replication`]: the link to a master when running as a replica
//! - [`server`]: shared context and the accept loop
//!
//! ## Expiry
//!
//! Keys with a TTL expire in two ways:
//! 1. **Lazy**: any access to an expired key removes it
//! 2. **Active**: the sweeper periodically purges expired keys through the
//!    synchronizer, so the worker stays the only owner of the store

pub mod commands;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod storage;
pub mod sync;

pub use commands::{Command, CommandError, CommandFactory};
pub use config::Config;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{Frame, ParseError, RespParser, RespValue};
pub use server::{serve, ServerContext};
pub use storage::{ExpiryConfig, ExpirySweeper, Store};
pub use sync::CommandSynchronizer;

/// The default port FerroKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host FerroKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of FerroKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Redis version reported to clients by `HELLO` and `INFO`.
pub const REDIS_COMPAT_VERSION: &str = "7.0.0";
