//! FerroKV - A Redis-Compatible Key-Value Server
//!
//! This is the main entry point for the FerroKV server.
//! It loads the snapshot, starts the command synchronizer and serves
//! connections until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use ferrokv::commands::Command;
use ferrokv::config::Config;
use ferrokv::server::{serve, ServerContext};
use ferrokv::storage::{Clock, ExpiryConfig, ExpirySweeper, Store, SystemClock};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config) {
    println!(
        r#"
FerroKV v{} - Redis-compatible key-value server
──────────────────────────────────────────────────────────────
Server started on {}
Snapshot file: {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        ferrokv::VERSION,
        config.bind_address(),
        config.snapshot_path().display(),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Set up logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    print_banner(&config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ctx = ServerContext::new(config, Arc::clone(&clock), Store::new(clock));
    ctx.synchronizer
        .start()
        .context("failed to start command synchronizer")?;

    load_snapshot(&ctx).await?;

    let sweeper = ctx
        .config
        .active_expire_interval()
        .map(|interval| {
            ExpirySweeper::start(
                Arc::clone(&ctx.synchronizer),
                ExpiryConfig::with_interval(interval),
            )
        });

    if let Some(master) = ctx.config.replicaof.clone() {
        ctx.replication
            .replicate_from(master, Arc::clone(&ctx))
            .context("failed to start replication")?;
    }

    info!("Listening on {}", ctx.config.bind_address());

    // Set up graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            // Keep the sender alive so the server keeps running
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
        let _ = shutdown_tx.send(true);
    });

    serve(listener, Arc::clone(&ctx), shutdown_rx).await;

    drop(sweeper);
    ctx.replication.promote();
    let synchronizer = Arc::clone(&ctx.synchronizer);
    let store = tokio::task::spawn_blocking(move || synchronizer.stop())
        .await
        .context("synchronizer shutdown task failed")??;

    info!(keys = store.len(), "Server shutdown complete");
    Ok(())
}

/// Loads the snapshot file, if there is one, through the synchronizer.
async fn load_snapshot(ctx: &ServerContext) -> anyhow::Result<()> {
    let path = ctx.persistence.path().display().to_string();
    let snapshot = match ctx
        .persistence
        .load()
        .with_context(|| format!("failed to load snapshot {}", path))?
    {
        Some(snapshot) => snapshot,
        None => {
            info!(path = %path, "No snapshot found, starting empty");
            return Ok(());
        }
    };

    ctx.synchronizer
        .post_and_wait(vec![Command::Restore(snapshot)])
        .await
        .context("failed to restore snapshot")?;
    Ok(())
}
