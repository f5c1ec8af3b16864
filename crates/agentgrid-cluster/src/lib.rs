//! agentgrid-cluster — membership and transport for the agentgrid cluster.
//!
//! Keeps every machine's view of "who exists and where" current, and
//! provides the tunnels the router uses to reach agents on machines
//! without a public address.
//!
//! # Architecture
//!
//! ```text
//! Hub (public address)
//!   ├── HubAcceptor (WebSocket, /cluster/ws)
//!   │   ├── join → welcome (full member list) + member_joined gossip
//!   │   ├── ping → pong, agents_sync → registry
//!   │   ├── close → member_left gossip
//!   │   └── relay_to_edge() → relay envelope down the tunnel
//!   ├── HubHeartbeat → GET {peer}/health every 60s
//!   └── Registry
//!
//! Edge (outbound only)
//!   └── EdgeClient
//!       ├── join handshake, bounded by a timeout
//!       ├── ping loop, closes after 3 missed pongs
//!       ├── reconnect with exponential backoff across learned hubs
//!       └── relay handler ← relay envelopes
//! ```

pub mod acceptor;
pub mod backoff;
pub mod client;
pub mod connections;
pub mod error;
pub mod heartbeat;
pub mod peer;
pub mod pending;
pub mod protocol;
pub mod registry;

pub use acceptor::{CLUSTER_WS_PATH, EdgeRelay, HubAcceptor};
pub use backoff::{ReconnectPolicy, ws_url};
pub use client::{EdgeClient, EdgeConfig, RelayHandler};
pub use connections::{ConnectionMap, EdgeHandle, InMemoryConnections, Outbound};
pub use error::{ClusterError, ClusterResult};
pub use heartbeat::HubHeartbeat;
pub use peer::{HttpPeers, PeerTransport};
pub use pending::{PendingError, PendingState, PendingTable, PendingWaiter};
pub use protocol::{Frame, RelayPayload};
pub use registry::{ClusterIdentity, PeerHub, Registry};
