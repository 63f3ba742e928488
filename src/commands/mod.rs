//! Command Module
//!
//! Turns request frames into typed commands and runs them against the store.
//!
//! ## Architecture
//!
//! ```text
//!      Frame (from a session or the replication link)
//!        │
//!        ▼
//! ┌─────────────────┐
//! │ CommandFactory  │  builder.rs: lookup, arity, flags, integers
//! └────────┬────────┘
//!          │  Command  or  CommandError (sent back as an error reply)
//!          ▼
//! ┌─────────────────────┐
//! │ CommandSynchronizer │  (sync module)
//! └────────┬────────────┘
//!          │  Command::execute(&mut Store)
//!          ▼
//! ┌─────────────────┐
//! │ keyspace.rs     │  GET SET DEL EXPIRE TTL PTTL KEYS
//! │ server.rs       │  PING ECHO HELLO CLIENT CONFIG INFO SAVE ...
//! └─────────────────┘
//! ```
//!
//! The builder never touches the store and commands never touch a socket.
//!
//! ## Supported Commands
//!
//! ### Keyspace
//! - `GET key`
//! - `SET key value [NX|XX] [EX seconds|PX milliseconds|KEEPTTL]`
//! - `DEL key [key ...]`
//! - `EXPIRE key seconds [NX|XX|GT|LT]`
//! - `TTL key`, `PTTL key`
//! - `KEYS pattern`
//!
//! ### Connection
//! - `PING [message]`, `ECHO message`, `HELLO [protover]`, `SELECT index`
//! - `CLIENT ID|GETNAME|SETNAME name`
//!
//! ### Server
//! - `CONFIG GET pattern [pattern ...]`, `INFO [section ...]`, `COMMAND`
//! - `SAVE`, `BGSAVE`, `LASTSAVE`
//! - `REPLICAOF host port|NO ONE` (alias `SLAVEOF`)

pub mod builder;
pub mod keyspace;
pub mod server;

pub use builder::CommandFactory;
pub use keyspace::{ExpireFlags, SetArgs, SetCondition, SetTtl, TtlUnit};

use crate::config::MasterAddr;
use crate::connection::ClientInfo;
use crate::persistence::Persistence;
use crate::protocol::RespValue;
use crate::server::ServerContext;
use crate::storage::{Snapshot, Store};
use crate::sync::Executable;
use bytes::Bytes;
use std::sync::Arc;

/// Where a frame came from.
#[derive(Debug, Clone)]
pub enum Origin {
    /// A client connection
    Client(Arc<ClientInfo>),
    /// The master this node replicates from
    Master,
}

impl Origin {
    pub fn client(&self) -> Option<&Arc<ClientInfo>> {
        match self {
            Origin::Client(client) => Some(client),
            Origin::Master => None,
        }
    }
}

/// A validated command, ready to run on the synchronizer's worker.
#[derive(Debug)]
pub enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Hello {
        client_id: u64,
        role: &'static str,
    },
    Select,
    ClientId(u64),
    ClientGetName(Arc<ClientInfo>),
    ClientSetName {
        client: Arc<ClientInfo>,
        name: Option<String>,
    },

    Get {
        key: Bytes,
    },
    Set(SetArgs),
    Del {
        keys: Vec<Bytes>,
    },
    Expire {
        key: Bytes,
        seconds: i64,
        flags: ExpireFlags,
    },
    Ttl {
        key: Bytes,
        unit: TtlUnit,
    },
    Keys {
        pattern: String,
    },

    ConfigGet(Vec<(&'static str, String)>),
    Info {
        ctx: Arc<ServerContext>,
        sections: Vec<String>,
    },
    CommandDocs,
    Save(Arc<Persistence>),
    BgSave(Arc<Persistence>),
    LastSave(Arc<Persistence>),
    ReplicaOf {
        ctx: Arc<ServerContext>,
        master: Option<MasterAddr>,
    },

    /// Drops every expired entry; scheduled by the expiry sweeper
    PurgeExpired,
    /// Replaces the keyspace; used by the replica after a full sync
    Restore(Snapshot),
}

impl Command {
    /// Commands a replica refuses from its own clients.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Set(_) | Command::Del { .. } | Command::Expire { .. }
        )
    }
}

impl Executable for Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Ping(_) => "ping",
            Command::Echo(_) => "echo",
            Command::Hello { .. } => "hello",
            Command::Select => "select",
            Command::ClientId(_) => "client|id",
            Command::ClientGetName(_) => "client|getname",
            Command::ClientSetName { .. } => "client|setname",
            Command::Get { .. } => "get",
            Command::Set(_) => "set",
            Command::Del { .. } => "del",
            Command::Expire { .. } => "expire",
            Command::Ttl {
                unit: TtlUnit::Seconds,
                ..
            } => "ttl",
            Command::Ttl {
                unit: TtlUnit::Millis,
                ..
            } => "pttl",
            Command::Keys { .. } => "keys",
            Command::ConfigGet(_) => "config|get",
            Command::Info { .. } => "info",
            Command::CommandDocs => "command",
            Command::Save(_) => "save",
            Command::BgSave(_) => "bgsave",
            Command::LastSave(_) => "lastsave",
            Command::ReplicaOf { .. } => "replicaof",
            Command::PurgeExpired => "purge-expired",
            Command::Restore(_) => "restore",
        }
    }

    fn execute(self, store: &mut Store) -> RespValue {
        match self {
            Command::Ping(None) => RespValue::pong(),
            Command::Ping(Some(message)) => RespValue::bulk_string(message),
            Command::Echo(message) => RespValue::bulk_string(message),
            Command::Hello { client_id, role } => server::hello(client_id, role),
            Command::Select => RespValue::ok(),
            Command::ClientId(id) => RespValue::integer(id as i64),
            Command::ClientGetName(client) => match client.name() {
                Some(name) => RespValue::bulk_string(name),
                None => RespValue::null(),
            },
            Command::ClientSetName { client, name } => {
                client.set_name(name);
                RespValue::ok()
            }

            Command::Get { key } => keyspace::get(store, &key),
            Command::Set(args) => keyspace::set(store, args),
            Command::Del { keys } => keyspace::del(store, &keys),
            Command::Expire {
                key,
                seconds,
                flags,
            } => keyspace::expire(store, &key, seconds, flags),
            Command::Ttl { key, unit } => keyspace::ttl(store, &key, unit),
            Command::Keys { pattern } => keyspace::keys(store, &pattern),

            Command::ConfigGet(pairs) => server::config_get(pairs),
            Command::Info { ctx, sections } => server::info(&ctx, store, &sections),
            Command::CommandDocs => RespValue::array(vec![]),
            Command::Save(persistence) => server::save(&persistence, store),
            Command::BgSave(persistence) => server::background_save(&persistence, store),
            Command::LastSave(persistence) => RespValue::integer(persistence.last_save() as i64),
            Command::ReplicaOf { ctx, master } => server::replica_of(&ctx, master),

            Command::PurgeExpired => RespValue::integer(store.purge_expired() as i64),
            Command::Restore(snapshot) => {
                store.replace(snapshot);
                RespValue::ok()
            }
        }
    }
}

/// Why a frame could not be turned into a command.
///
/// The display text is exactly what the client receives after the `-`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpireTime(&'static str),

    #[error("ERR unknown command '{name}', with args beginning with: {args}")]
    UnknownCommand { name: String, args: String },

    #[error("ERR unknown subcommand '{subcommand}'. Try {command} HELP.")]
    UnknownSubcommand { command: String, subcommand: String },

    #[error("ERR DB index is out of range")]
    DbIndexOutOfRange,

    #[error("NOPROTO sorry, this protocol version is not supported.")]
    NoProto,

    #[error("READONLY You can't write against a read only replica.")]
    ReadOnly,

    #[error("ERR NX and XX, GT or LT options at the same time are not compatible")]
    ExpireNxConflict,

    #[error("ERR GT and LT options at the same time are not compatible")]
    ExpireGtLtConflict,

    #[error("ERR Client names cannot contain spaces, newlines or special characters.")]
    InvalidClientName,

    #[error("ERR Invalid master port")]
    InvalidMasterPort,
}

impl From<CommandError> for RespValue {
    fn from(err: CommandError) -> Self {
        RespValue::error(err.to_string())
    }
}
