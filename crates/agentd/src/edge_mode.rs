//! Edge mode — machine without a public address.
//!
//! In this mode, the daemon:
//! 1. Dials the first reachable hub and joins the cluster over `/cluster/ws`
//! 2. Applies relayed message/spawn/stop requests to local agents
//! 3. Reports its agent list to the hub, again on every ping interval
//!    so a reconnected tunnel catches up
//! 4. Serves the local HTTP API until Ctrl-C, then leaves the cluster

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use agentgrid_api::{ApiState, build_router, relay};
use agentgrid_cluster::{ClusterIdentity, EdgeClient, EdgeConfig, HttpPeers, Registry};
use agentgrid_core::AgentdConfig;
use agentgrid_router::{MemoryAdapter, Router};

pub async fn run_edge(machine_id: String, config: AgentdConfig) -> anyhow::Result<()> {
    if config.hubs.is_empty() {
        anyhow::bail!("edge mode needs at least one hub (--hub or `hubs` in agentd.toml)");
    }
    let port = config.port_or_default();
    let timing = &config.timing;
    info!(%machine_id, hubs = ?config.hubs, "agentd starting in edge mode");

    // ── Membership ─────────────────────────────────────────────────
    let registry = Arc::new(Registry::new(ClusterIdentity::new(
        &machine_id,
        config.secret.clone(),
    )));

    // ── Router ─────────────────────────────────────────────────────
    let peers = Arc::new(HttpPeers::new(config.secret.clone(), timing.peer_timeout()));
    let router = Router::new(registry.clone(), peers).with_adapter(Arc::new(MemoryAdapter::new()));

    // ── Tunnel ─────────────────────────────────────────────────────
    let edge_config = EdgeConfig::from_timing(config.hubs.clone(), timing)
        .with_capabilities(config.capabilities.clone());
    let client = EdgeClient::new(registry.clone(), edge_config);

    let state = ApiState::new(Arc::new(router))
        .with_edge(client.clone())
        .with_capabilities(config.capabilities.clone());
    client.set_relay_handler(relay::handler(state.clone()));

    client.start().await?;
    state.publish_agents().await;

    // ── Agent reports ──────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let report_handle = tokio::spawn(report_agents(
        state.clone(),
        timing.ping_interval(),
        shutdown_rx,
    ));

    // ── Start API server ───────────────────────────────────────────
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            crate::shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = report_handle.await;
    client.disconnect();
    info!("edge stopped");
    Ok(())
}

/// Re-publish the local agent list every `interval` until shutdown.
async fn report_agents(
    state: ApiState,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                state.publish_agents().await;
                debug!("agent list reported");
            }
            _ = shutdown.changed() => break,
        }
    }
}
