//! Server wiring: the shared context and the accept loop.

use crate::commands::CommandFactory;
use crate::config::Config;
use crate::connection::{handle_connection, ConnectionStats};
use crate::persistence::Persistence;
use crate::replication::ReplicationManager;
use crate::storage::{Clock, Store};
use crate::sync::CommandSynchronizer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Everything sessions, commands and the replica link share.
pub struct ServerContext {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<ConnectionStats>,
    pub persistence: Arc<Persistence>,
    pub replication: Arc<ReplicationManager>,
    pub synchronizer: Arc<CommandSynchronizer>,
    started_at: Instant,
    next_client_id: AtomicU64,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("synchronizer", &self.synchronizer)
            .field("replication", &self.replication.status())
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    /// Creates the context. `store` is handed to the synchronizer, which
    /// still has to be started.
    ///
    /// Call from inside a tokio runtime if the node may become a replica.
    pub fn new(config: Config, clock: Arc<dyn Clock>, store: Store) -> Arc<Self> {
        let persistence = Persistence::new(config.snapshot_path(), Arc::clone(&clock));
        let synchronizer = CommandSynchronizer::new(store, config.queue_capacity);

        Arc::new(Self {
            config: Arc::new(config),
            clock,
            stats: Arc::new(ConnectionStats::new()),
            persistence: Arc::new(persistence),
            replication: Arc::new(ReplicationManager::new()),
            synchronizer: Arc::new(synchronizer),
            started_at: Instant::now(),
            next_client_id: AtomicU64::new(1),
        })
    }

    /// Ids start at 1 and are never reused.
    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn factory(self: &Arc<Self>) -> CommandFactory {
        CommandFactory::new(Arc::clone(self))
    }
}

/// Accepts connections until `shutdown` flips to true.
///
/// Each connection gets its own task and a clone of `shutdown`, so open
/// sessions end at their next read once shutdown starts.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    Arc::clone(&ctx),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
    info!("Stopped accepting connections");
}
