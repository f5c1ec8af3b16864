//! Backend adapter contract.
//!
//! An adapter hosts agents of one kind (a terminal multiplexer driver, a
//! backend RPC client, the in-memory test backend) and is opaque to the
//! router beyond this trait.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use agentgrid_core::{AgentInfo, SpawnRequest};

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Failure reported by a backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("{kind} adapter does not support {operation}")]
    Unsupported {
        kind: String,
        operation: &'static str,
    },

    #[error("{0}")]
    Backend(String),
}

/// A local backend that hosts agents.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Backend kind, e.g. `generic`. Matched against `SpawnRequest::kind`.
    fn kind(&self) -> &str;

    async fn has_agent(&self, agent_id: &str) -> AdapterResult<bool>;

    async fn send_message(&self, agent_id: &str, from: &str, message: &str) -> AdapterResult<()>;

    async fn list_agents(&self) -> AdapterResult<Vec<AgentInfo>>;

    fn supports_spawn(&self) -> bool {
        false
    }

    /// Start an agent and return its id.
    async fn spawn_agent(&self, _request: &SpawnRequest) -> AdapterResult<String> {
        Err(AdapterError::Unsupported {
            kind: self.kind().to_string(),
            operation: "spawn",
        })
    }

    fn supports_stop(&self) -> bool {
        false
    }

    async fn stop_agent(&self, _agent_id: &str) -> AdapterResult<()> {
        Err(AdapterError::Unsupported {
            kind: self.kind().to_string(),
            operation: "stop",
        })
    }
}

/// A short random agent id, e.g. `agent-3f9c1a2b`.
pub fn new_agent_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("agent-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_prefixed_and_distinct() {
        let a = new_agent_id();
        let b = new_agent_id();
        assert!(a.starts_with("agent-"));
        assert_eq!(a.len(), "agent-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn unsupported_names_the_operation() {
        let err = AdapterError::Unsupported {
            kind: "generic".into(),
            operation: "stop",
        };
        assert_eq!(err.to_string(), "generic adapter does not support stop");
    }
}
