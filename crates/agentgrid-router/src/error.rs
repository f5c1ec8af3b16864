//! Routing failures and their wire classification.

use http::StatusCode;
use thiserror::Error;

use agentgrid_core::{ErrorBody, ErrorCode};

use crate::adapter::AdapterError;

pub type RouteResult<T> = Result<T, RouteError>;

#[derive(Debug, Error)]
pub enum RouteError {
    /// Explicit target unknown to the registry. Not retried.
    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    /// A peer could not be reached or answered with a failure. Retryable.
    #[error("{}", unreachable_message(.machine.as_deref()))]
    RemoteUnreachable {
        machine: Option<String>,
        detail: String,
    },

    /// Every reachable candidate was asked and none hosts the agent.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Adapter failed: {0}")]
    Adapter(#[source] AdapterError),

    #[error("Spawn failed: {0}")]
    SpawnFailed(#[source] AdapterError),

    #[error("Stop failed: {0}")]
    StopFailed(#[source] AdapterError),

    #[error("No adapter for type \"{0}\"")]
    NoAdapter(String),

    #[error("Adapter \"{kind}\" does not support {operation}")]
    Unsupported {
        kind: String,
        operation: &'static str,
    },
}

fn unreachable_message(machine: Option<&str>) -> String {
    match machine {
        Some(machine) => format!("Machine {machine} unreachable"),
        None => "Remote machines unreachable".to_string(),
    }
}

impl RouteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RouteError::MachineNotFound(_) => ErrorCode::MachineNotFound,
            RouteError::RemoteUnreachable { .. } => ErrorCode::RemoteUnreachable,
            RouteError::AgentNotFound(_) => ErrorCode::AgentNotFound,
            RouteError::Adapter(_) => ErrorCode::InternalError,
            RouteError::SpawnFailed(_) => ErrorCode::SpawnFailed,
            RouteError::StopFailed(_) => ErrorCode::StopFailed,
            RouteError::NoAdapter(_) => ErrorCode::NoAdapter,
            RouteError::Unsupported { .. } => ErrorCode::AdapterNoStop,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::MachineNotFound(_) | RouteError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            RouteError::RemoteUnreachable { .. } => StatusCode::BAD_GATEWAY,
            RouteError::NoAdapter(_) | RouteError::Unsupported { .. } => StatusCode::BAD_REQUEST,
            RouteError::Adapter(_) | RouteError::SpawnFailed(_) | RouteError::StopFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            RouteError::RemoteUnreachable { detail, .. } => Some(detail.clone()),
            _ => None,
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RouteError::RemoteUnreachable { .. })
    }

    pub fn body(&self) -> ErrorBody {
        let body = ErrorBody::new(self.code(), self.to_string());
        match self.detail() {
            Some(detail) => body.with_detail(detail),
            None => body,
        }
    }
}
