//! agentgrid-core — shared vocabulary for the agentgrid cluster.
//!
//! Every other crate speaks in these types: the membership record each
//! machine publishes, the agent summaries adapters report, the request
//! bodies peers exchange over HTTP, the stable error codes, and the
//! daemon's TOML configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AgentdConfig, TimingConfig};
pub use error::{ErrorBody, ErrorCode};
pub use types::*;
