//! In-memory adapter — agents are map entries with an inbox.
//!
//! The daemon's default backend, and the one the tests drive.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info};

use agentgrid_core::{AgentInfo, AgentStatus, SpawnRequest, epoch_millis};

use crate::adapter::{Adapter, AdapterError, AdapterResult, new_agent_id};

pub const MEMORY_KIND: &str = "generic";

/// A message delivered to an in-memory agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    pub from: String,
    pub message: String,
    /// Epoch milliseconds.
    pub received_at: u64,
}

struct MemoryAgent {
    info: AgentInfo,
    inbox: Vec<InboxMessage>,
}

#[derive(Default)]
pub struct MemoryAdapter {
    agents: RwLock<BTreeMap<String, MemoryAgent>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a running agent.
    pub fn with_agent(self, agent_id: &str) -> Self {
        self.insert(agent_id, None, false);
        self
    }

    /// Messages delivered to `agent_id`, oldest first.
    pub fn inbox(&self, agent_id: &str) -> Vec<InboxMessage> {
        self.agents
            .read()
            .expect("agents lock")
            .get(agent_id)
            .map(|a| a.inbox.clone())
            .unwrap_or_default()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.read().expect("agents lock").keys().cloned().collect()
    }

    fn insert(&self, agent_id: &str, task: Option<String>, persistent: bool) {
        let info = AgentInfo {
            id: agent_id.to_string(),
            kind: MEMORY_KIND.to_string(),
            status: AgentStatus::Running,
            persistent,
            task,
            description: None,
        };
        self.agents.write().expect("agents lock").insert(
            agent_id.to_string(),
            MemoryAgent {
                info,
                inbox: Vec::new(),
            },
        );
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn kind(&self) -> &str {
        MEMORY_KIND
    }

    async fn has_agent(&self, agent_id: &str) -> AdapterResult<bool> {
        Ok(self.agents.read().expect("agents lock").contains_key(agent_id))
    }

    async fn send_message(&self, agent_id: &str, from: &str, message: &str) -> AdapterResult<()> {
        let mut agents = self.agents.write().expect("agents lock");
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| AdapterError::AgentNotFound(agent_id.to_string()))?;
        agent.inbox.push(InboxMessage {
            from: from.to_string(),
            message: message.to_string(),
            received_at: epoch_millis(),
        });
        debug!(%agent_id, %from, "message stored in memory inbox");
        Ok(())
    }

    async fn list_agents(&self) -> AdapterResult<Vec<AgentInfo>> {
        Ok(self
            .agents
            .read()
            .expect("agents lock")
            .values()
            .map(|a| a.info.clone())
            .collect())
    }

    fn supports_spawn(&self) -> bool {
        true
    }

    async fn spawn_agent(&self, request: &SpawnRequest) -> AdapterResult<String> {
        let agent_id = request
            .agent_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_agent_id);
        self.insert(&agent_id, Some(request.task.clone()), request.persistent);
        info!(%agent_id, "memory agent spawned");
        Ok(agent_id)
    }

    fn supports_stop(&self) -> bool {
        true
    }

    async fn stop_agent(&self, agent_id: &str) -> AdapterResult<()> {
        match self.agents.write().expect("agents lock").remove(agent_id) {
            Some(_) => {
                info!(%agent_id, "memory agent stopped");
                Ok(())
            }
            None => Err(AdapterError::AgentNotFound(agent_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_request(agent_id: Option<&str>) -> SpawnRequest {
        SpawnRequest {
            kind: MEMORY_KIND.into(),
            agent_id: agent_id.map(str::to_string),
            task: "watch logs".into(),
            machine: None,
            persistent: true,
        }
    }

    #[tokio::test]
    async fn send_to_unknown_agent_fails() {
        let adapter = MemoryAdapter::new();
        let err = adapter.send_message("w1", "cli", "hi").await.unwrap_err();
        assert_eq!(err, AdapterError::AgentNotFound("w1".into()));
    }

    #[tokio::test]
    async fn messages_land_in_inbox_in_order() {
        let adapter = MemoryAdapter::new().with_agent("w1");
        adapter.send_message("w1", "a", "one").await.unwrap();
        adapter.send_message("w1", "b", "two").await.unwrap();

        let inbox = adapter.inbox("w1");
        let texts: Vec<_> = inbox.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(inbox[1].from, "b");
    }

    #[tokio::test]
    async fn spawn_then_stop() {
        let adapter = MemoryAdapter::new();
        let id = adapter.spawn_agent(&spawn_request(Some("w9"))).await.unwrap();
        assert_eq!(id, "w9");
        assert!(adapter.has_agent("w9").await.unwrap());

        let agents = adapter.list_agents().await.unwrap();
        assert_eq!(agents[0].task.as_deref(), Some("watch logs"));
        assert!(agents[0].persistent);

        adapter.stop_agent("w9").await.unwrap();
        assert!(!adapter.has_agent("w9").await.unwrap());
        assert!(adapter.stop_agent("w9").await.is_err());
    }

    #[tokio::test]
    async fn spawn_without_id_generates_one() {
        let adapter = MemoryAdapter::new();
        let id = adapter.spawn_agent(&spawn_request(None)).await.unwrap();
        assert!(id.starts_with("agent-"));
        assert_eq!(adapter.agent_ids(), vec![id]);
    }
}
