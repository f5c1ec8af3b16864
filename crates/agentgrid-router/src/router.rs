//! Message router — resolves an agent id to a transport and delivers.
//!
//! Resolution order for [`Router::deliver`]:
//!
//! ```text
//! target given, not self ──► edge with open tunnel ─► relay "/message"
//!                        ├─► known hub ─────────────► POST {bridge}/message
//!                        └─► unknown ───────────────► MachineNotFound
//! otherwise ─► local adapters, registration order
//!           └► fan-out: GET /agents on every reachable hub, concurrently;
//!              first positive gets the forward; failures are recorded
//!              and the scan goes on
//! nothing found ─► RemoteUnreachable (any peer failed) | AgentNotFound
//! ```
//!
//! The router owns no mutable state. Relay is fire-and-forget: success
//! means the envelope was queued on the tunnel.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::join_all;
use futures_util::stream::FuturesUnordered;
use serde_json::json;
use tracing::{debug, info, warn};

use agentgrid_cluster::{ClusterError, EdgeRelay, PeerHub, PeerTransport, Registry};
use agentgrid_core::{AgentInfo, AgentLocation, ClusterMember, MessageBody, SpawnRequest, SpawnResponse};

use crate::adapter::{Adapter, new_agent_id};
use crate::error::{RouteError, RouteResult};

/// How a message reached its agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a local adapter of this kind.
    Local { kind: String },
    /// Queued on the tunnel to an edge.
    Relayed { machine: String },
    /// Accepted by a peer hub over HTTP.
    Forwarded { machine: String },
}

pub struct Router {
    registry: Arc<Registry>,
    relay: Option<Arc<dyn EdgeRelay>>,
    adapters: Vec<Arc<dyn Adapter>>,
    peers: Arc<dyn PeerTransport>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, peers: Arc<dyn PeerTransport>) -> Self {
        Self {
            registry,
            relay: None,
            adapters: Vec::new(),
            peers,
        }
    }

    /// Relay through this hub's edge tunnels. Hubs only.
    pub fn with_relay(mut self, relay: Arc<dyn EdgeRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Register a local adapter. Registration order is lookup order.
    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn peers(&self) -> &Arc<dyn PeerTransport> {
        &self.peers
    }

    pub fn adapters(&self) -> &[Arc<dyn Adapter>] {
        &self.adapters
    }

    // ── Delivery ───────────────────────────────────────────────────

    pub async fn deliver(
        &self,
        agent_id: &str,
        from: &str,
        message: &str,
        target: Option<&str>,
    ) -> RouteResult<Delivery> {
        let body = MessageBody {
            agent_id: agent_id.to_string(),
            from: from.to_string(),
            message: message.to_string(),
        };

        if let Some(machine) = self.remote_target(target) {
            return self.deliver_to_machine(machine, &body).await;
        }

        if let Some(kind) = self.deliver_local(&body).await? {
            return Ok(Delivery::Local { kind });
        }

        self.scan_and_forward(&body).await
    }

    /// Deliver to a locally hosted agent only. Never contacts another
    /// machine: an agent no local adapter hosts is `AgentNotFound`.
    pub async fn deliver_local_only(
        &self,
        agent_id: &str,
        from: &str,
        message: &str,
    ) -> RouteResult<Delivery> {
        let body = MessageBody {
            agent_id: agent_id.to_string(),
            from: from.to_string(),
            message: message.to_string(),
        };
        match self.deliver_local(&body).await? {
            Some(kind) => Ok(Delivery::Local { kind }),
            None => Err(RouteError::AgentNotFound(agent_id.to_string())),
        }
    }

    /// `target` unless it is empty or names this machine.
    fn remote_target<'a>(&self, target: Option<&'a str>) -> Option<&'a str> {
        target.filter(|m| !m.is_empty() && *m != self.registry.self_id())
    }

    async fn deliver_to_machine(&self, machine: &str, body: &MessageBody) -> RouteResult<Delivery> {
        let Some(member) = self.registry.get_member(machine) else {
            warn!(%machine, agent_id = %body.agent_id, "delivery target not in registry");
            return Err(RouteError::MachineNotFound(machine.to_string()));
        };

        if member.is_edge() {
            let payload = json!({
                "agent_id": body.agent_id,
                "from": body.from,
                "message": body.message,
            });
            self.relay_to(machine, "/message", payload)?;
            return Ok(Delivery::Relayed {
                machine: machine.to_string(),
            });
        }

        let peer = peer_of(&member)?;
        self.peers
            .send_message(&peer, body)
            .await
            .map_err(|e| unreachable(machine, &e))?;
        info!(%machine, agent_id = %body.agent_id, "message forwarded to hub");
        Ok(Delivery::Forwarded {
            machine: machine.to_string(),
        })
    }

    /// Queue `payload` on the tunnel to edge `machine`.
    fn relay_to(&self, machine: &str, path: &str, payload: serde_json::Value) -> RouteResult<()> {
        let Some(relay) = self.relay.as_ref().filter(|r| r.has_edge(machine)) else {
            debug!(%machine, %path, "edge has no tunnel to this machine");
            return Err(RouteError::RemoteUnreachable {
                machine: Some(machine.to_string()),
                detail: format!("edge {machine} is not connected to this hub"),
            });
        };
        if relay.relay_to_edge(machine, path, payload) {
            debug!(%machine, %path, "relay sent");
            Ok(())
        } else {
            debug!(%machine, %path, "relay failed");
            Err(RouteError::RemoteUnreachable {
                machine: Some(machine.to_string()),
                detail: "relay send failed".to_string(),
            })
        }
    }

    async fn deliver_local(&self, body: &MessageBody) -> RouteResult<Option<String>> {
        let Some(adapter) = self.local_host(&body.agent_id).await else {
            return Ok(None);
        };
        adapter
            .send_message(&body.agent_id, &body.from, &body.message)
            .await
            .map_err(RouteError::Adapter)?;
        debug!(agent_id = %body.agent_id, kind = adapter.kind(), "delivered locally");
        Ok(Some(adapter.kind().to_string()))
    }

    /// First adapter, in registration order, that hosts `agent_id`.
    async fn local_host(&self, agent_id: &str) -> Option<&Arc<dyn Adapter>> {
        for adapter in &self.adapters {
            match adapter.has_agent(agent_id).await {
                Ok(true) => return Some(adapter),
                Ok(false) => {}
                Err(e) => debug!(%agent_id, kind = adapter.kind(), error = %e, "adapter lookup failed"),
            }
        }
        None
    }

    async fn scan_and_forward(&self, body: &MessageBody) -> RouteResult<Delivery> {
        let candidates = self.registry.reachable_hubs();
        debug!(agent_id = %body.agent_id, candidates = candidates.len(), "cluster scan");

        let mut queries: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|peer| async move {
                let listed = self.peers.list_agents(&peer).await;
                (peer, listed)
            })
            .collect();

        let mut failures = Vec::new();
        while let Some((peer, listed)) = queries.next().await {
            let agents = match listed {
                Ok(agents) => agents,
                Err(e) => {
                    warn!(machine = %peer.machine_id, error = %e, "cluster scan query failed");
                    failures.push(e.to_string());
                    continue;
                }
            };
            if !agents.iter().any(|a| a.id == body.agent_id) {
                continue;
            }
            match self.peers.send_message(&peer, body).await {
                Ok(()) => {
                    info!(machine = %peer.machine_id, agent_id = %body.agent_id, "message forwarded to hub");
                    return Ok(Delivery::Forwarded {
                        machine: peer.machine_id,
                    });
                }
                Err(e) => {
                    warn!(machine = %peer.machine_id, error = %e, "forward failed");
                    failures.push(e.to_string());
                }
            }
        }

        Err(not_found_or_unreachable(&body.agent_id, failures))
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// Find the machine hosting `agent_id`: local adapters first, then every
    /// reachable hub in parallel.
    pub async fn locate(&self, agent_id: &str) -> RouteResult<AgentLocation> {
        if let Some(adapter) = self.local_host(agent_id).await {
            let kind = adapter
                .list_agents()
                .await
                .ok()
                .and_then(|agents| agents.into_iter().find(|a| a.id == agent_id))
                .map(|a| a.kind)
                .unwrap_or_else(|| adapter.kind().to_string());
            return Ok(AgentLocation {
                agent_id: agent_id.to_string(),
                machine: self.registry.self_id().to_string(),
                bridge: self
                    .registry
                    .get_member(self.registry.self_id())
                    .and_then(|m| m.bridge_url),
                kind,
            });
        }

        let candidates = self.registry.reachable_hubs();
        let results = join_all(candidates.iter().map(|peer| self.peers.list_agents(peer))).await;

        let mut failures = Vec::new();
        for (peer, listed) in candidates.into_iter().zip(results) {
            match listed {
                Ok(agents) => {
                    if let Some(found) = agents.into_iter().find(|a| a.id == agent_id) {
                        return Ok(AgentLocation {
                            agent_id: agent_id.to_string(),
                            machine: peer.machine_id,
                            bridge: Some(peer.bridge_url),
                            kind: found.kind,
                        });
                    }
                }
                Err(e) => {
                    debug!(machine = %peer.machine_id, error = %e, "locate query failed");
                    failures.push(e.to_string());
                }
            }
        }

        Err(not_found_or_unreachable(agent_id, failures))
    }

    /// Agents hosted by the local adapters. Failing adapters are skipped.
    pub async fn list_local_agents(&self) -> Vec<AgentInfo> {
        let mut all = Vec::new();
        for adapter in &self.adapters {
            match adapter.list_agents().await {
                Ok(agents) => all.extend(agents),
                Err(e) => warn!(kind = adapter.kind(), error = %e, "adapter listing failed"),
            }
        }
        all
    }

    /// Ids for `agents_sync`.
    pub async fn local_agent_ids(&self) -> Vec<String> {
        self.list_local_agents().await.into_iter().map(|a| a.id).collect()
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Start an agent here or on `request.machine`.
    pub async fn spawn(&self, request: &SpawnRequest) -> RouteResult<SpawnResponse> {
        let target = request
            .machine
            .as_deref()
            .filter(|m| *m != "auto");
        if let Some(machine) = self.remote_target(target) {
            return self.spawn_remote(machine, request).await;
        }

        let Some(adapter) = self
            .adapters
            .iter()
            .find(|a| a.kind() == request.kind && a.supports_spawn())
        else {
            return Err(RouteError::NoAdapter(request.kind.clone()));
        };

        let agent_id = adapter
            .spawn_agent(request)
            .await
            .map_err(RouteError::SpawnFailed)?;
        info!(%agent_id, kind = %request.kind, "agent spawned");
        Ok(SpawnResponse {
            ok: true,
            agent_id,
            machine: self.registry.self_id().to_string(),
        })
    }

    async fn spawn_remote(&self, machine: &str, request: &SpawnRequest) -> RouteResult<SpawnResponse> {
        let Some(member) = self.registry.get_member(machine) else {
            return Err(RouteError::MachineNotFound(machine.to_string()));
        };

        let mut forwarded = request.clone();
        forwarded.machine = None;

        if member.is_edge() {
            // The tunnel carries no reply, so pin the id before relaying.
            let agent_id = forwarded
                .agent_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(new_agent_id);
            forwarded.agent_id = Some(agent_id.clone());
            let payload = serde_json::to_value(&forwarded).map_err(|e| RouteError::RemoteUnreachable {
                machine: Some(machine.to_string()),
                detail: format!("encode spawn request: {e}"),
            })?;
            self.relay_to(machine, "/spawn", payload)?;
            return Ok(SpawnResponse {
                ok: true,
                agent_id,
                machine: machine.to_string(),
            });
        }

        let peer = peer_of(&member)?;
        self.peers
            .spawn(&peer, &forwarded)
            .await
            .map_err(|e| unreachable(machine, &e))
    }

    /// Stop a locally hosted agent.
    pub async fn stop(&self, agent_id: &str) -> RouteResult<()> {
        let Some(adapter) = self.local_host(agent_id).await else {
            return Err(RouteError::AgentNotFound(agent_id.to_string()));
        };
        if !adapter.supports_stop() {
            return Err(RouteError::Unsupported {
                kind: adapter.kind().to_string(),
                operation: "stop",
            });
        }
        adapter
            .stop_agent(agent_id)
            .await
            .map_err(RouteError::StopFailed)?;
        info!(%agent_id, "agent stopped");
        Ok(())
    }
}

fn peer_of(member: &ClusterMember) -> RouteResult<PeerHub> {
    match &member.bridge_url {
        Some(url) => Ok(PeerHub {
            machine_id: member.machine_id.clone(),
            bridge_url: url.clone(),
        }),
        None => Err(RouteError::RemoteUnreachable {
            machine: Some(member.machine_id.clone()),
            detail: "no bridge url".to_string(),
        }),
    }
}

fn unreachable(machine: &str, error: &ClusterError) -> RouteError {
    let detail = match error {
        ClusterError::Peer { detail, .. } => detail.clone(),
        other => other.to_string(),
    };
    RouteError::RemoteUnreachable {
        machine: Some(machine.to_string()),
        detail,
    }
}

fn not_found_or_unreachable(agent_id: &str, failures: Vec<String>) -> RouteError {
    if failures.is_empty() {
        RouteError::AgentNotFound(agent_id.to_string())
    } else {
        RouteError::RemoteUnreachable {
            machine: None,
            detail: failures.join("; "),
        }
    }
}
