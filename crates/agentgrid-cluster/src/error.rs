//! Error types for cluster membership and peer transport.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised by the edge client and the peer transport.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no hub addresses configured")]
    NoHubs,

    #[error("invalid hub address: {address}")]
    InvalidAddress { address: String },

    #[error("failed to connect to hub {hub}: {reason}")]
    Connect { hub: String, reason: String },

    #[error("timed out connecting to hub {hub}")]
    ConnectTimeout { hub: String },

    /// The hub answered the join with an `error` frame.
    #[error("hub error: {code} - {message}")]
    Rejected { code: String, message: String },

    #[error("hub {hub} did not answer the join in time")]
    HandshakeTimeout { hub: String },

    #[error("connection closed before the join completed")]
    Closed,

    #[error("peer {machine} unreachable: {detail}")]
    Peer { machine: String, detail: String },
}

impl ClusterError {
    /// Whether the hub refused the shared secret.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ClusterError::Rejected { code, .. } if code == "AUTH_FAILED")
    }

    pub(crate) fn peer(machine: impl Into<String>, detail: impl Into<String>) -> Self {
        ClusterError::Peer {
            machine: machine.into(),
            detail: detail.into(),
        }
    }
}
