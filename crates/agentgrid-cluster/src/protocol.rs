//! Cluster WebSocket protocol: one JSON object per text frame, tagged
//! by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentgrid_core::{ClusterMember, ErrorCode};

/// Opaque path + body carried by a `relay` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPayload {
    pub path: String,
    #[serde(default)]
    pub body: Value,
}

/// Every frame exchanged between a hub and its edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Edge → Hub.
    Join {
        secret: String,
        machine_id: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    /// Hub → Edge.
    Welcome {
        members: Vec<ClusterMember>,
        hub_id: String,
    },
    /// Hub → Edge.
    Error { code: String, message: String },
    /// Edge → Hub.
    Ping,
    /// Hub → Edge.
    Pong,
    /// Hub → Edge.
    Relay { payload: RelayPayload },
    /// Hub → Edge.
    MemberJoined { member: ClusterMember },
    /// Hub → Edge.
    MemberLeft { machine_id: String },
    /// Edge → Hub.
    AgentsSync {
        machine_id: String,
        #[serde(default)]
        agents: Vec<String>,
    },
}

impl Frame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error {
            code: code.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn relay(path: impl Into<String>, body: Value) -> Self {
        Frame::Relay {
            payload: RelayPayload {
                path: path.into(),
                body,
            },
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a text frame. Malformed or unknown frames yield `None`.
    pub fn decode(text: &str) -> Option<Frame> {
        serde_json::from_str(text).ok()
    }

    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Join { .. } => "join",
            Frame::Welcome { .. } => "welcome",
            Frame::Error { .. } => "error",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::Relay { .. } => "relay",
            Frame::MemberJoined { .. } => "member_joined",
            Frame::MemberLeft { .. } => "member_left",
            Frame::AgentsSync { .. } => "agents_sync",
        }
    }
}
