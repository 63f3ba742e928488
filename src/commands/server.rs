//! Connection and server commands.

use crate::config::MasterAddr;
use crate::persistence::{Persistence, PersistenceError};
use crate::protocol::RespValue;
use crate::server::ServerContext;
use crate::storage::Store;
use bytes::Bytes;
use std::fmt::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info};

/// The only protocol version this server speaks.
pub const PROTOCOL_VERSION: i64 = 2;

/// Sections `INFO` reports, in order.
pub const INFO_SECTIONS: &[&str] = &[
    "server",
    "clients",
    "stats",
    "persistence",
    "replication",
    "keyspace",
];

/// HELLO reply: a flat field/value array, the RESP2 shape of a map.
pub(crate) fn hello(client_id: u64, role: &'static str) -> RespValue {
    RespValue::array(vec![
        RespValue::bulk_string("server"),
        RespValue::bulk_string("redis"),
        RespValue::bulk_string("version"),
        RespValue::bulk_string(crate::REDIS_COMPAT_VERSION),
        RespValue::bulk_string("proto"),
        RespValue::integer(PROTOCOL_VERSION),
        RespValue::bulk_string("id"),
        RespValue::integer(client_id as i64),
        RespValue::bulk_string("mode"),
        RespValue::bulk_string("standalone"),
        RespValue::bulk_string("role"),
        RespValue::bulk_string(role),
        RespValue::bulk_string("modules"),
        RespValue::array(vec![]),
    ])
}

pub(crate) fn config_get(pairs: Vec<(&'static str, String)>) -> RespValue {
    RespValue::array(
        pairs
            .into_iter()
            .flat_map(|(name, value)| {
                [
                    RespValue::bulk_string(name),
                    RespValue::bulk_string(value),
                ]
            })
            .collect(),
    )
}

/// SAVE: encodes and writes the snapshot before replying.
pub(crate) fn save(persistence: &Persistence, store: &Store) -> RespValue {
    match persistence.save(&store.snapshot()) {
        Ok(()) => RespValue::ok(),
        Err(e) => save_error(e),
    }
}

/// BGSAVE: copies the keyspace here, writes it on another thread.
pub(crate) fn background_save(persistence: &Arc<Persistence>, store: &Store) -> RespValue {
    match persistence.background_save(store.snapshot()) {
        Ok(()) => RespValue::simple_string("Background saving started"),
        Err(e) => save_error(e),
    }
}

fn save_error(e: PersistenceError) -> RespValue {
    match e {
        PersistenceError::SaveInProgress => RespValue::error(format!("ERR {}", e)),
        other => {
            error!(error = %other, "Snapshot save failed");
            RespValue::error(format!("ERR {}", other))
        }
    }
}

/// REPLICAOF host port / REPLICAOF NO ONE.
pub(crate) fn replica_of(ctx: &Arc<ServerContext>, master: Option<MasterAddr>) -> RespValue {
    match master {
        Some(master) => match ctx.replication.replicate_from(master, Arc::clone(ctx)) {
            Ok(()) => RespValue::ok(),
            Err(e) => RespValue::error(format!("ERR {}", e)),
        },
        None => {
            ctx.replication.promote();
            info!("Replication stopped, now serving as master");
            RespValue::ok()
        }
    }
}

/// INFO: one bulk string of `# Section` blocks.
pub(crate) fn info(ctx: &ServerContext, store: &Store, sections: &[String]) -> RespValue {
    let wanted: Vec<&str> = if sections.is_empty()
        || sections
            .iter()
            .any(|s| matches!(s.as_str(), "all" | "default" | "everything"))
    {
        INFO_SECTIONS.to_vec()
    } else {
        INFO_SECTIONS
            .iter()
            .copied()
            .filter(|name| sections.iter().any(|s| s == name))
            .collect()
    };

    let mut out = String::new();
    for (i, section) in wanted.iter().enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        // Writing to a String cannot fail
        let _ = match *section {
            "server" => info_server(&mut out, ctx),
            "clients" => info_clients(&mut out, ctx),
            "stats" => info_stats(&mut out, ctx, store),
            "persistence" => info_persistence(&mut out, ctx),
            "replication" => info_replication(&mut out, ctx),
            "keyspace" => info_keyspace(&mut out, store),
            _ => Ok(()),
        };
    }

    RespValue::bulk_string(Bytes::from(out))
}

fn info_server(out: &mut String, ctx: &ServerContext) -> std::fmt::Result {
    write!(
        out,
        "# Server\r\n\
         redis_version:{}\r\n\
         ferrokv_version:{}\r\n\
         redis_mode:standalone\r\n\
         os:{}\r\n\
         process_id:{}\r\n\
         tcp_port:{}\r\n\
         uptime_in_seconds:{}\r\n",
        crate::REDIS_COMPAT_VERSION,
        crate::VERSION,
        std::env::consts::OS,
        std::process::id(),
        ctx.config.port,
        ctx.uptime().as_secs(),
    )
}

fn info_clients(out: &mut String, ctx: &ServerContext) -> std::fmt::Result {
    write!(
        out,
        "# Clients\r\nconnected_clients:{}\r\n",
        ctx.stats.active_connections.load(Ordering::Relaxed)
    )
}

fn info_stats(out: &mut String, ctx: &ServerContext, store: &Store) -> std::fmt::Result {
    let stats = &ctx.stats;
    write!(
        out,
        "# Stats\r\n\
         total_connections_received:{}\r\n\
         total_commands_processed:{}\r\n\
         total_net_input_bytes:{}\r\n\
         total_net_output_bytes:{}\r\n\
         expired_keys:{}\r\n",
        stats.connections_accepted.load(Ordering::Relaxed),
        stats.commands_processed.load(Ordering::Relaxed),
        stats.bytes_read.load(Ordering::Relaxed),
        stats.bytes_written.load(Ordering::Relaxed),
        store.expired_keys(),
    )
}

fn info_persistence(out: &mut String, ctx: &ServerContext) -> std::fmt::Result {
    let persistence = &ctx.persistence;
    write!(
        out,
        "# Persistence\r\n\
         rdb_bgsave_in_progress:{}\r\n\
         rdb_last_save_time:{}\r\n\
         rdb_saves:{}\r\n",
        u8::from(persistence.save_in_progress()),
        persistence.last_save(),
        persistence.saves(),
    )
}

fn info_replication(out: &mut String, ctx: &ServerContext) -> std::fmt::Result {
    let status = ctx.replication.status();
    write!(out, "# Replication\r\nrole:{}\r\n", status.role.info_name())?;
    if let Some(master) = &status.master {
        write!(
            out,
            "master_host:{}\r\n\
             master_port:{}\r\n\
             master_link_status:{}\r\n\
             master_sync_in_progress:{}\r\n\
             slave_repl_offset:{}\r\n",
            master.host,
            master.port,
            if status.link.is_up() { "up" } else { "down" },
            u8::from(status.link.is_syncing()),
            status.offset,
        )?;
        if let Some(id) = &status.replication_id {
            write!(out, "master_replid:{}\r\n", id)?;
        }
    }
    write!(out, "connected_slaves:0\r\n")
}

fn info_keyspace(out: &mut String, store: &Store) -> std::fmt::Result {
    write!(out, "# Keyspace\r\n")?;
    if !store.is_empty() {
        write!(
            out,
            "db0:keys={},expires={},avg_ttl=0\r\n",
            store.len(),
            store.volatile_len()
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::{ManualClock, SetExpiry};

    fn context() -> Arc<ServerContext> {
        let dir = crate::persistence::tests::temp_dir("server-cmds");
        let config = Config {
            dir,
            ..Config::default()
        };
        ServerContext::new(config, Arc::new(ManualClock::starting_now()), Store::default())
    }

    fn info_text(reply: RespValue) -> String {
        String::from_utf8(reply.as_bytes().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_hello_reply() {
        let reply = hello(7, "master");
        let fields = reply.as_array().unwrap();
        assert_eq!(fields.len(), 14);
        assert_eq!(fields[1], RespValue::bulk_string("redis"));
        assert_eq!(fields[5], RespValue::integer(2));
        assert_eq!(fields[7], RespValue::integer(7));
        assert_eq!(fields[11], RespValue::bulk_string("master"));
        assert_eq!(fields[13], RespValue::array(vec![]));
    }

    #[test]
    fn test_config_get_flattens_pairs() {
        let reply = config_get(vec![("dir", "/data".to_string()), ("port", "6379".to_string())]);
        assert_eq!(
            reply.serialize(),
            b"*4\r\n$3\r\ndir\r\n$5\r\n/data\r\n$4\r\nport\r\n$4\r\n6379\r\n"
        );
    }

    #[test]
    fn test_info_sections() {
        let ctx = context();
        let mut store = Store::default();
        store.set(Bytes::from("k"), Bytes::from("v"), SetExpiry::Clear);

        let all = info_text(info(&ctx, &store, &[]));
        for header in [
            "# Server",
            "# Clients",
            "# Stats",
            "# Persistence",
            "# Replication",
            "# Keyspace",
        ] {
            assert!(all.contains(header), "missing {}", header);
        }
        assert!(all.contains("db0:keys=1,expires=0"));
        assert!(all.contains("role:master"));

        let only = info_text(info(&ctx, &store, &["keyspace".to_string()]));
        assert!(only.starts_with("# Keyspace\r\n"));
        assert!(!only.contains("# Server"));
    }

    #[test]
    fn test_save_and_lastsave() {
        let ctx = context();
        let mut store = Store::default();
        store.set(Bytes::from("k"), Bytes::from("v"), SetExpiry::Clear);

        assert_eq!(save(&ctx.persistence, &store), RespValue::ok());
        assert_eq!(ctx.persistence.saves(), 1);

        let loaded = ctx.persistence.load().unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
