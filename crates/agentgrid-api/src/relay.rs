//! Relay envelopes arriving at an edge.
//!
//! The hub forwards `{path, body}` pairs shaped like the HTTP requests the
//! edge would have received directly. They are applied to the local router
//! and never answered: the tunnel has no reply channel.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use agentgrid_cluster::{RelayHandler, RelayPayload};
use agentgrid_core::{MessageBody, SpawnRequest};
use agentgrid_router::RouteError;

use crate::ApiState;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed {path} body: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown relay path {0}")]
    UnknownPath(String),

    #[error(transparent)]
    Route(#[from] RouteError),
}

#[derive(Deserialize)]
struct StopRelay {
    agent_id: String,
}

/// Apply one relay envelope to the local router.
pub async fn dispatch(state: &ApiState, payload: RelayPayload) -> Result<(), RelayError> {
    let RelayPayload { path, body } = payload;

    match path.as_str() {
        "/message" => {
            let msg: MessageBody = decode(&path, body)?;
            // The hub already resolved the target to this machine: an
            // unknown agent is not re-routed back into the cluster.
            state
                .router
                .deliver_local_only(&msg.agent_id, &msg.from, &msg.message)
                .await?;
            debug!(agent_id = %msg.agent_id, from = %msg.from, "relayed message delivered");
        }
        "/spawn" => {
            let mut request: SpawnRequest = decode(&path, body)?;
            request.machine = None;
            let spawned = state.router.spawn(&request).await?;
            debug!(agent_id = %spawned.agent_id, "relayed spawn completed");
            state.publish_agents().await;
        }
        "/stop" => {
            let stop: StopRelay = decode(&path, body)?;
            state.router.stop(&stop.agent_id).await?;
            debug!(agent_id = %stop.agent_id, "relayed stop completed");
            state.publish_agents().await;
        }
        _ => return Err(RelayError::UnknownPath(path)),
    }
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(
    path: &str,
    body: serde_json::Value,
) -> Result<T, RelayError> {
    serde_json::from_value(body).map_err(|source| RelayError::Malformed {
        path: path.to_string(),
        source,
    })
}

/// A [`RelayHandler`] that dispatches each envelope on its own task.
pub fn handler(state: ApiState) -> RelayHandler {
    Arc::new(move |payload: RelayPayload| {
        let state = state.clone();
        tokio::spawn(async move {
            let path = payload.path.clone();
            if let Err(e) = dispatch(&state, payload).await {
                warn!(%path, error = %e, "relay dropped");
            }
        });
    })
}
