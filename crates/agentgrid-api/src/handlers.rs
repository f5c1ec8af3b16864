//! HTTP handlers.
//!
//! Missing or unparseable bodies answer 400 `MISSING_FIELDS`; routing
//! failures carry the router's code, status, and detail.

use std::time::Duration;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use agentgrid_cluster::Frame;
use agentgrid_core::{
    AgentStatus, ClusterMember, ErrorBody, ErrorCode, HubAnnouncement, MembersResponse, SpawnRequest,
};
use agentgrid_router::RouteError;

use crate::ApiState;

/// Bound on each best-effort `/cluster/join` notification to another hub.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

fn error_response(status: StatusCode, body: ErrorBody) -> Response {
    (status, Json(body)).into_response()
}

fn missing_fields(message: &str) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        ErrorBody::new(ErrorCode::MissingFields, message),
    )
}

fn route_error(error: RouteError) -> Response {
    if error.is_retryable() {
        warn!(error = %error, detail = ?error.detail(), "request failed");
    } else {
        debug!(error = %error, "request failed");
    }
    error_response(error.status(), error.body())
}

fn ok() -> Response {
    Json(json!({ "ok": true })).into_response()
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let registry = state.registry();
    Json(json!({
        "status": "ok",
        "machine_id": registry.self_id(),
        "members": registry.len(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Serialize)]
struct PersistentAgent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

/// GET /info
pub async fn info(State(state): State<ApiState>) -> impl IntoResponse {
    let agents = state.router.list_local_agents().await;
    let running = agents.len();
    let persistent: Vec<PersistentAgent> = agents
        .into_iter()
        .filter(|a| a.persistent)
        .map(|a| PersistentAgent {
            id: a.id,
            kind: a.kind,
            status: a.status,
            description: a.description,
        })
        .collect();

    Json(json!({
        "machine_id": state.registry().self_id(),
        "capabilities": state.capabilities,
        "running_agents": running,
        "persistent_agents": persistent,
    }))
}

// ── Agents ─────────────────────────────────────────────────────

/// GET /agents
pub async fn list_agents(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.router.list_local_agents().await)
}

#[derive(Deserialize)]
pub struct LocateQuery {
    pub agent_id: Option<String>,
}

/// GET /locate?agent_id=
pub async fn locate(
    State(state): State<ApiState>,
    query: Result<Query<LocateQuery>, QueryRejection>,
) -> Response {
    let Some(agent_id) = query
        .ok()
        .and_then(|Query(q)| q.agent_id)
        .filter(|id| !id.is_empty())
    else {
        return missing_fields("agent_id is required");
    };

    match state.router.locate(&agent_id).await {
        Ok(location) => Json(location).into_response(),
        Err(e) => route_error(e),
    }
}

#[derive(Deserialize)]
pub struct MessageRequest {
    pub agent_id: Option<String>,
    pub from: Option<String>,
    pub message: Option<String>,
    pub machine: Option<String>,
}

/// POST /message
pub async fn message(
    State(state): State<ApiState>,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = payload else {
        return missing_fields("agent_id and message are required");
    };
    let (Some(agent_id), Some(message)) = (
        req.agent_id.filter(|s| !s.is_empty()),
        req.message.filter(|s| !s.is_empty()),
    ) else {
        return missing_fields("agent_id and message are required");
    };
    let from = req
        .from
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "anonymous".to_string());

    debug!(%agent_id, %from, machine = ?req.machine, "POST /message");
    match state
        .router
        .deliver(&agent_id, &from, &message, req.machine.as_deref())
        .await
    {
        Ok(_) => ok(),
        Err(e) => route_error(e),
    }
}

#[derive(Deserialize)]
pub struct SpawnBody {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub agent_id: Option<String>,
    pub task: Option<String>,
    pub machine: Option<String>,
    #[serde(default)]
    pub persistent: bool,
}

/// POST /spawn
pub async fn spawn(
    State(state): State<ApiState>,
    payload: Result<Json<SpawnBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = payload else {
        return missing_fields("type and task are required");
    };
    let (Some(kind), Some(task)) = (
        body.kind.filter(|s| !s.is_empty()),
        body.task.filter(|s| !s.is_empty()),
    ) else {
        return missing_fields("type and task are required");
    };

    let request = SpawnRequest {
        kind,
        agent_id: body.agent_id,
        task,
        machine: body.machine,
        persistent: body.persistent,
    };
    match state.router.spawn(&request).await {
        Ok(spawned) => {
            if spawned.machine == state.registry().self_id() {
                state.publish_agents().await;
            }
            Json(spawned).into_response()
        }
        Err(e) => route_error(e),
    }
}

#[derive(Deserialize)]
pub struct StopBody {
    pub agent_id: Option<String>,
}

/// POST /stop
pub async fn stop(
    State(state): State<ApiState>,
    payload: Result<Json<StopBody>, JsonRejection>,
) -> Response {
    let Some(agent_id) = payload
        .ok()
        .and_then(|Json(body)| body.agent_id)
        .filter(|id| !id.is_empty())
    else {
        return missing_fields("agent_id is required");
    };

    debug!(%agent_id, "POST /stop");
    match state.router.stop(&agent_id).await {
        Ok(()) => {
            state.publish_agents().await;
            ok()
        }
        Err(e) => route_error(e),
    }
}

// ── Cluster ────────────────────────────────────────────────────

/// GET /cluster/members
pub async fn cluster_members(State(state): State<ApiState>) -> impl IntoResponse {
    Json(MembersResponse {
        members: state.registry().members(),
    })
}

#[derive(Deserialize)]
pub struct JoinBody {
    pub machine_id: Option<String>,
    pub bridge_url: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// POST /cluster/join
pub async fn cluster_join(
    State(state): State<ApiState>,
    payload: Result<Json<JoinBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = payload else {
        return missing_fields("machine_id and bridge_url required");
    };
    let (Some(machine_id), Some(bridge_url)) = (
        body.machine_id.filter(|s| !s.is_empty()),
        body.bridge_url.filter(|s| !s.is_empty()),
    ) else {
        return missing_fields("machine_id and bridge_url required");
    };

    info!(%machine_id, %bridge_url, "hub announced itself");

    let registry = state.registry();
    let already_known = registry
        .get_member(&machine_id)
        .is_some_and(|m| m.is_hub() && m.bridge_url.as_deref() == Some(bridge_url.as_str()));

    let member = ClusterMember::hub(&machine_id, &bridge_url, body.capabilities.clone());
    registry.add_member(member.clone());

    if let Some(heartbeat) = &state.heartbeat {
        heartbeat.start(&member).await;
    }
    if let Some(acceptor) = &state.acceptor {
        acceptor.broadcast(&Frame::MemberJoined { member }, None);
    }

    // Relaying only first sightings keeps two hubs from re-announcing
    // the same member to each other forever.
    if !already_known {
        notify_other_hubs(
            &state,
            HubAnnouncement {
                machine_id,
                bridge_url,
                capabilities: body.capabilities,
            },
        );
    }

    Json(MembersResponse {
        members: registry.members(),
    })
    .into_response()
}

/// Best-effort: tell every other known hub about `announcement`.
fn notify_other_hubs(state: &ApiState, announcement: HubAnnouncement) {
    for hub in state.registry().reachable_hubs() {
        if hub.machine_id == announcement.machine_id {
            continue;
        }
        let peers = state.router.peers().clone();
        let announcement = announcement.clone();
        tokio::spawn(async move {
            let call = peers.announce(&hub.bridge_url, &announcement);
            match tokio::time::timeout(ANNOUNCE_TIMEOUT, call).await {
                Ok(Ok(_)) => debug!(to = %hub.machine_id, about = %announcement.machine_id, "hub announcement relayed"),
                Ok(Err(e)) => debug!(to = %hub.machine_id, error = %e, "hub announcement failed"),
                Err(_) => debug!(to = %hub.machine_id, "hub announcement timed out"),
            }
        });
    }
}
