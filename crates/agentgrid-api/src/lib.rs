//! agentgrid-api — HTTP surface of an agentgrid machine.
//!
//! Thin translations of query and body fields into router and registry
//! calls. Every route except the cluster WebSocket sits behind the bearer
//! middleware in [`auth`]. On an edge, [`relay`] applies the envelopes
//! its hub forwards down the tunnel.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness, used by hub heartbeats |
//! | GET | `/info` | Machine id, capabilities, agent counts |
//! | GET | `/agents` | Agents hosted by local adapters |
//! | GET | `/locate?agent_id=` | Find the machine hosting an agent |
//! | POST | `/message` | Deliver a message to an agent |
//! | POST | `/spawn` | Start an agent here or on another machine |
//! | POST | `/stop` | Stop a local agent |
//! | GET | `/cluster/members` | Current membership view |
//! | POST | `/cluster/join` | A hub announces itself |
//! | GET | `/cluster/ws` | Edge tunnel (hubs only, not authenticated) |

pub mod auth;
pub mod handlers;
pub mod relay;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use agentgrid_cluster::{EdgeClient, HubAcceptor, HubHeartbeat, Registry};
use agentgrid_router::Router as AgentRouter;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub router: Arc<AgentRouter>,
    /// Present when this machine is a hub.
    pub acceptor: Option<Arc<HubAcceptor>>,
    pub heartbeat: Option<Arc<HubHeartbeat>>,
    /// Present when this machine is an edge.
    pub edge: Option<EdgeClient>,
    pub capabilities: Vec<String>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(router: Arc<AgentRouter>) -> Self {
        Self {
            router,
            acceptor: None,
            heartbeat: None,
            edge: None,
            capabilities: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn with_hub(mut self, acceptor: Arc<HubAcceptor>, heartbeat: Arc<HubHeartbeat>) -> Self {
        self.acceptor = Some(acceptor);
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_edge(mut self, edge: EdgeClient) -> Self {
        self.edge = Some(edge);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.router.registry()
    }

    /// Push the local agent list to the hub when running as an edge.
    pub async fn publish_agents(&self) {
        if let Some(edge) = &self.edge {
            let agents = self.router.local_agent_ids().await;
            edge.sync_agents(agents);
        }
    }
}

/// Build the complete HTTP router.
pub fn build_router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/info", get(handlers::info))
        .route("/agents", get(handlers::list_agents))
        .route("/locate", get(handlers::locate))
        .route("/message", post(handlers::message))
        .route("/spawn", post(handlers::spawn))
        .route("/stop", post(handlers::stop))
        .route("/cluster/members", get(handlers::cluster_members))
        .route("/cluster/join", post(handlers::cluster_join))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_secret))
        .with_state(state.clone());

    match state.acceptor {
        Some(acceptor) => api.merge(acceptor.router()),
        None => api,
    }
}
