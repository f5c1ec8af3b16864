//! agentgrid-router — delivers messages to agents wherever they run.
//!
//! # Components
//!
//! - **`adapter`** — the backend contract local agents are hosted behind
//! - **`memory`** — in-memory backend with per-agent inboxes
//! - **`router`** — `deliver`, `locate`, `spawn` and `stop` across the cluster

pub mod adapter;
pub mod error;
pub mod memory;
pub mod router;

pub use adapter::{Adapter, AdapterError, AdapterResult, new_agent_id};
pub use error::{RouteError, RouteResult};
pub use memory::{InboxMessage, MEMORY_KIND, MemoryAdapter};
pub use router::{Delivery, Router};
