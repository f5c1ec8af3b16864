//! Hub mode — publicly reachable machine.
//!
//! In this mode, the daemon:
//! 1. Registers itself in the membership registry under its public URL
//! 2. Accepts edge tunnels on `/cluster/ws`
//! 3. Announces itself to the configured peer hubs and merges their view
//! 4. Heartbeats every known peer hub
//! 5. Serves the HTTP API until Ctrl-C

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use agentgrid_api::{ApiState, build_router};
use agentgrid_cluster::{
    ClusterIdentity, HttpPeers, HubAcceptor, HubHeartbeat, PeerTransport, Registry,
};
use agentgrid_core::{AgentdConfig, ClusterMember, HubAnnouncement};
use agentgrid_router::{MemoryAdapter, Router};

pub async fn run_hub(machine_id: String, config: AgentdConfig) -> anyhow::Result<()> {
    let port = config.port_or_default();
    let timing = &config.timing;
    let public_url = config
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://127.0.0.1:{port}"));
    info!(%machine_id, %public_url, "agentd starting in hub mode");

    // ── Membership ─────────────────────────────────────────────────
    let registry = Arc::new(Registry::new(ClusterIdentity::new(
        &machine_id,
        config.secret.clone(),
    )));
    registry.add_member(ClusterMember::hub(
        &machine_id,
        &public_url,
        config.capabilities.clone(),
    ));
    if registry.secret().is_none() {
        warn!("no cluster secret configured, joins and API calls are unauthenticated");
    }

    // ── Transports ─────────────────────────────────────────────────
    let peers = Arc::new(HttpPeers::new(config.secret.clone(), timing.peer_timeout()));
    let acceptor = Arc::new(HubAcceptor::new(registry.clone()).with_join_grace(timing.join_grace()));
    let heartbeat = Arc::new(HubHeartbeat::new(
        registry.clone(),
        peers.clone(),
        timing.hub_heartbeat(),
    ));
    info!(
        join_grace = ?timing.join_grace(),
        heartbeat = ?timing.hub_heartbeat(),
        "cluster transports initialized"
    );

    // ── Router ─────────────────────────────────────────────────────
    let router = Router::new(registry.clone(), peers.clone())
        .with_relay(acceptor.clone())
        .with_adapter(Arc::new(MemoryAdapter::new()));

    // ── Join peer hubs ─────────────────────────────────────────────
    let announcement = HubAnnouncement {
        machine_id: machine_id.clone(),
        bridge_url: public_url.clone(),
        capabilities: config.capabilities.clone(),
    };
    for peer_url in &config.join {
        join_peer(&registry, peers.as_ref(), &heartbeat, peer_url, &announcement).await;
    }

    // ── Start API server ───────────────────────────────────────────
    let state = ApiState::new(Arc::new(router))
        .with_hub(acceptor, heartbeat.clone())
        .with_capabilities(config.capabilities.clone());
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(crate::shutdown_signal())
        .await?;

    heartbeat.stop_all().await;
    info!("hub stopped");
    Ok(())
}

/// Announce this hub to `peer_url` and merge the members it reports.
async fn join_peer(
    registry: &Registry,
    peers: &dyn PeerTransport,
    heartbeat: &HubHeartbeat,
    peer_url: &str,
    announcement: &HubAnnouncement,
) {
    let members = match peers.announce(peer_url, announcement).await {
        Ok(response) => response.members,
        Err(e) => {
            warn!(peer = %peer_url, error = %e, "failed to join peer hub");
            return;
        }
    };

    let mut learned = 0;
    for member in members {
        if member.machine_id == registry.self_id() || !member.is_hub() {
            continue;
        }
        heartbeat.start(&member).await;
        registry.add_member(member);
        learned += 1;
    }
    info!(peer = %peer_url, hubs = learned, "joined peer hub");
}
