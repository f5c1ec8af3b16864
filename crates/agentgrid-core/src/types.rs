//! Domain types shared across the cluster, router, and API crates.
//!
//! All types are JSON-serializable; field names match the wire format
//! peers and edges exchange.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a machine in the cluster.
pub type MachineId = String;

/// Identifier of an agent hosted by some backend.
pub type AgentId = String;

// ── Membership ─────────────────────────────────────────────────────

/// Role a machine plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Publicly reachable; accepts inbound HTTP and WebSocket connections.
    Hub,
    /// Reachable only through its single outbound WebSocket to a hub.
    Edge,
}

/// One entry per known machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub machine_id: MachineId,
    #[serde(rename = "type")]
    pub role: MemberRole,
    /// Hub only: externally reachable HTTP base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_url: Option<String>,
    /// Edge only: machine id of the hub that admitted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_hub: Option<MachineId>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Agents believed to be hosted there. Informational only.
    #[serde(default)]
    pub agents: Vec<AgentId>,
    /// Unix timestamp (milliseconds) of the last liveness signal.
    #[serde(default)]
    pub last_seen: u64,
}

impl ClusterMember {
    /// A hub record reachable at `bridge_url`.
    pub fn hub(
        machine_id: impl Into<String>,
        bridge_url: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            role: MemberRole::Hub,
            bridge_url: Some(bridge_url.into()),
            connected_hub: None,
            capabilities: capabilities.into_iter().collect(),
            agents: Vec::new(),
            last_seen: epoch_millis(),
        }
    }

    /// An edge record attached to `connected_hub`.
    pub fn edge(
        machine_id: impl Into<String>,
        connected_hub: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            role: MemberRole::Edge,
            bridge_url: None,
            connected_hub: Some(connected_hub.into()),
            capabilities: capabilities.into_iter().collect(),
            agents: Vec::new(),
            last_seen: epoch_millis(),
        }
    }

    pub fn is_hub(&self) -> bool {
        self.role == MemberRole::Hub
    }

    pub fn is_edge(&self) -> bool {
        self.role == MemberRole::Edge
    }
}

// ── Agents ─────────────────────────────────────────────────────────

/// Lifecycle state an adapter reports for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Idle,
    Stopped,
}

/// An agent as reported by a local backend adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    /// Backend kind ("generic", "claude-code", ...).
    #[serde(rename = "type")]
    pub kind: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The subset of an agent record a peer's `GET /agents` must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: AgentId,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl From<&AgentInfo> for AgentSummary {
    fn from(info: &AgentInfo) -> Self {
        Self {
            id: info.id.clone(),
            kind: info.kind.clone(),
        }
    }
}

// ── Request bodies ─────────────────────────────────────────────────

/// Body of a forwarded `POST /message`.
///
/// Carries no machine field: the receiving hub must resolve the agent
/// locally or by scan, never forward on an explicit target again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub agent_id: AgentId,
    pub from: String,
    pub message: String,
}

/// Request to start an agent on some backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<MachineId>,
    #[serde(default)]
    pub persistent: bool,
}

/// Outcome of a successful spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub ok: bool,
    pub agent_id: AgentId,
    pub machine: MachineId,
}

/// Body of `POST /cluster/join`: a hub announcing itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubAnnouncement {
    pub machine_id: MachineId,
    pub bridge_url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Response of `POST /cluster/join` and `GET /cluster/members`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<ClusterMember>,
}

/// Where an agent was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLocation {
    pub agent_id: AgentId,
    pub machine: MachineId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Current Unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_serializes_role_as_type() {
        let member = ClusterMember::hub("hub-1", "http://10.0.0.1:9100", vec!["generic".into()]);
        let json = serde_json::to_value(&member).unwrap();
        assert_eq!(json["type"], "hub");
        assert_eq!(json["bridge_url"], "http://10.0.0.1:9100");
        assert!(json.get("connected_hub").is_none());
    }

    #[test]
    fn member_parses_sparse_record() {
        let member: ClusterMember =
            serde_json::from_str(r#"{"machine_id":"edge-1","type":"edge","connected_hub":"hub-1"}"#)
                .unwrap();
        assert!(member.is_edge());
        assert_eq!(member.connected_hub.as_deref(), Some("hub-1"));
        assert!(member.capabilities.is_empty());
        assert_eq!(member.last_seen, 0);
    }

    #[test]
    fn summary_tolerates_missing_type() {
        let agents: Vec<AgentSummary> =
            serde_json::from_str(r#"[{"id":"w1"},{"id":"w2","type":"generic","status":"idle"}]"#)
                .unwrap();
        assert_eq!(agents[0].kind, "");
        assert_eq!(agents[1].kind, "generic");
    }

    #[test]
    fn message_body_has_no_machine_field() {
        let body = MessageBody {
            agent_id: "w1".into(),
            from: "ceo".into(),
            message: "go".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("machine").is_none());
    }
}
