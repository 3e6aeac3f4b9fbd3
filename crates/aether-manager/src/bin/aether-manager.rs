//! Manager process entry point.
//!
//! Reads its shard assignment from the environment, connects to the
//! supervisor and runs until told to restart. Exits non-zero on termination
//! so the process manager respawns it.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpStream;

use aether_manager::{ManagerConfig, ResourceRegistry, init_tracing, run_manager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ManagerConfig::from_env().context("failed to load manager configuration")?;
    tracing::info!(
        version = %config.ready.build.version,
        commit = %config.ready.build.commit,
        supervisor = %config.supervisor_addr,
        "aether-manager starting"
    );

    let stream = TcpStream::connect(&config.supervisor_addr)
        .await
        .with_context(|| format!("failed to connect to supervisor at {}", config.supervisor_addr))?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for ctrl-c, running without it");
            std::future::pending::<()>().await;
        }
    };

    let outcome = run_manager(
        reader,
        writer,
        &config,
        Arc::new(ResourceRegistry::new()),
        shutdown,
    )
    .await
    .context("manager event loop failed")?;

    std::process::exit(outcome.exit_code());
}
