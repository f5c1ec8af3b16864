//! Stable, machine-readable error codes and the JSON error body.

use serde::{Deserialize, Serialize};

/// Stable error codes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingFields,
    NoAdapter,
    AdapterNoStop,
    AgentNotFound,
    InternalError,
    MachineNotFound,
    SpawnFailed,
    StopFailed,
    RemoteUnreachable,
    AuthRequired,
    AuthFailed,
    JoinTimeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MissingFields => "MISSING_FIELDS",
            ErrorCode::NoAdapter => "NO_ADAPTER",
            ErrorCode::AdapterNoStop => "ADAPTER_NO_STOP",
            ErrorCode::AgentNotFound => "AGENT_NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::MachineNotFound => "MACHINE_NOT_FOUND",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::StopFailed => "STOP_FAILED",
            ErrorCode::RemoteUnreachable => "REMOTE_UNREACHABLE",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::JoinTimeout => "JOIN_TIMEOUT",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body: `{error_code, error, detail?}`.
///
/// `error_code` stays a plain string on decode so bodies from newer
/// peers with unknown codes still parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            error_code: code.as_str().to_string(),
            error: error.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// One-line summary, e.g. `AGENT_NOT_FOUND: no such agent (detail)`.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if !self.error_code.is_empty() {
            out.push_str(&self.error_code);
            out.push_str(": ");
        }
        out.push_str(&self.error);
        if let Some(detail) = &self.detail {
            out.push_str(&format!(" ({detail})"));
        }
        out
    }
}
