//! Connection Module
//!
//! Everything between a socket and the command synchronizer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (server.rs)                              │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept(), one task per client
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Session                               │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ FrameReader │───>│ Build cmds  │───>│ Synchronizer│     │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘     │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      ┌─────────────┐        │
//! │                                      │ One write   │        │
//! │                                      └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`FrameReader`] is also used by the replica link to read the
//! master's stream, which mixes line replies, a raw snapshot payload and
//! ordinary command frames.

pub mod reader;
pub mod session;

pub use reader::{FrameReader, ReadError, MAX_FRAME_SIZE};
pub use session::{handle_connection, ClientInfo, ConnectionError, ConnectionStats, Session};
