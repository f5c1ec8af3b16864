//! Hub acceptor — server side of the cluster WebSocket.
//!
//! Runs on hub machines. Admits edges that present the shared secret,
//! answers their pings, records their agent lists, and keeps one
//! machine-id → connection mapping per admitted edge so the router can
//! relay messages down the tunnel.
//!
//! Per connection: unauthenticated → (join) → registered → (close) →
//! terminated. A connection that has not joined within the grace window
//! gets a `JOIN_TIMEOUT` error and is closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use agentgrid_core::{ClusterMember, ErrorCode};

use crate::connections::{ConnectionMap, EdgeHandle, InMemoryConnections, Outbound};
use crate::protocol::{Frame, RelayPayload};
use crate::registry::Registry;

/// Fixed path edges connect to.
pub const CLUSTER_WS_PATH: &str = "/cluster/ws";

/// What the router needs from a hub to reach its edges.
pub trait EdgeRelay: Send + Sync {
    /// Whether `machine_id` has an open tunnel to this hub.
    fn has_edge(&self, machine_id: &str) -> bool;

    /// Queue a relay envelope for `machine_id`. Never waits for the edge.
    fn relay_to_edge(&self, machine_id: &str, path: &str, body: Value) -> bool;
}

/// Accepts and tracks edge connections.
pub struct HubAcceptor {
    registry: Arc<Registry>,
    connections: Arc<dyn ConnectionMap>,
    join_grace: Duration,
    next_connection: AtomicU64,
}

enum Flow {
    Continue,
    Close,
}

impl HubAcceptor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            connections: Arc::new(InMemoryConnections::new()),
            join_grace: Duration::from_secs(10),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Use a different connection table.
    pub fn with_connections(mut self, connections: Arc<dyn ConnectionMap>) -> Self {
        self.connections = connections;
        self
    }

    /// Set how long a new connection may take to send `join`.
    pub fn with_join_grace(mut self, grace: Duration) -> Self {
        self.join_grace = grace;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// axum routes serving [`CLUSTER_WS_PATH`].
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(CLUSTER_WS_PATH, get(upgrade))
            .with_state(self)
    }

    /// Send `frame` to every open edge except `exclude`. Returns the count.
    pub fn broadcast(&self, frame: &Frame, exclude: Option<&str>) -> usize {
        let mut sent = 0;
        self.connections.for_each_open(&mut |id, handle| {
            if Some(id) != exclude && handle.send(frame.clone()) {
                sent += 1;
            }
        });
        sent
    }

    /// Machine ids with an open tunnel.
    pub fn connected_edges(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.connections
            .for_each_open(&mut |id, _| ids.push(id.to_string()));
        ids.sort();
        ids
    }

    /// Drive one accepted socket until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (sink, mut stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EdgeHandle::new(connection, tx);
        let writer = tokio::spawn(write_loop(sink, rx));

        let deadline = Instant::now() + self.join_grace;
        let mut edge_id: Option<String> = None;

        debug!(connection, "cluster socket accepted");

        loop {
            let next = if edge_id.is_some() {
                stream.next().await
            } else {
                match tokio::time::timeout_at(deadline, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(connection, grace = ?self.join_grace, "no join received, closing");
                        handle.send(Frame::error(ErrorCode::JoinTimeout, "Join timeout"));
                        break;
                    }
                }
            };

            let text = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(connection, error = %e, "cluster socket error");
                    break;
                }
            };

            let Some(frame) = Frame::decode(text.as_str()) else {
                debug!(connection, "dropping malformed frame");
                continue;
            };

            if let Flow::Close = self.on_frame(frame, &handle, &mut edge_id) {
                break;
            }
        }

        if let Some(machine_id) = edge_id {
            if self.connections.unregister(&machine_id, connection) {
                self.registry.remove_member(&machine_id);
                info!(%machine_id, "edge disconnected");
                self.broadcast(
                    &Frame::MemberLeft {
                        machine_id: machine_id.clone(),
                    },
                    Some(&machine_id),
                );
            }
        }

        handle.close();
        drop(handle);
        let _ = writer.await;
    }

    fn on_frame(&self, frame: Frame, handle: &EdgeHandle, edge_id: &mut Option<String>) -> Flow {
        match frame {
            Frame::Join {
                secret,
                machine_id,
                capabilities,
            } => {
                if let Some(current) = edge_id.as_deref() {
                    debug!(machine_id = %current, "duplicate join ignored");
                    return Flow::Continue;
                }
                if !self.registry.secret_matches(&secret) {
                    warn!(%machine_id, "edge join rejected: invalid secret");
                    handle.send(Frame::error(ErrorCode::AuthFailed, "Invalid secret"));
                    return Flow::Close;
                }
                if machine_id.is_empty() || machine_id == self.registry.self_id() {
                    warn!(%machine_id, "edge join rejected: unusable machine id");
                    handle.send(Frame::error(ErrorCode::MissingFields, "Invalid machine_id"));
                    return Flow::Close;
                }
                self.admit(machine_id, capabilities, handle, edge_id);
                Flow::Continue
            }
            Frame::Ping => {
                if let Some(id) = edge_id.as_deref() {
                    self.registry.touch(id);
                }
                handle.send(Frame::Pong);
                Flow::Continue
            }
            Frame::AgentsSync { agents, .. } => {
                if let Some(id) = edge_id.as_deref() {
                    debug!(machine_id = %id, count = agents.len(), "agents sync");
                    self.registry.update_agents(id, agents);
                }
                Flow::Continue
            }
            other => {
                debug!(kind = other.kind(), "ignoring unexpected frame from edge");
                Flow::Continue
            }
        }
    }

    fn admit(
        &self,
        machine_id: String,
        capabilities: Vec<String>,
        handle: &EdgeHandle,
        edge_id: &mut Option<String>,
    ) {
        let hub_id = self.registry.self_id().to_string();
        self.registry
            .add_member(ClusterMember::edge(&machine_id, &hub_id, capabilities));

        if let Some(previous) = self.connections.register(&machine_id, handle.clone()) {
            warn!(%machine_id, "edge reconnected, closing previous tunnel");
            previous.close();
        }
        *edge_id = Some(machine_id.clone());

        handle.send(Frame::Welcome {
            members: self.registry.members(),
            hub_id,
        });
        info!(%machine_id, "edge joined");

        if let Some(member) = self.registry.get_member(&machine_id) {
            self.broadcast(&Frame::MemberJoined { member }, Some(&machine_id));
        }
    }
}

impl EdgeRelay for HubAcceptor {
    fn has_edge(&self, machine_id: &str) -> bool {
        self.connections
            .lookup(machine_id)
            .is_some_and(|h| h.is_open())
    }

    fn relay_to_edge(&self, machine_id: &str, path: &str, body: Value) -> bool {
        let Some(handle) = self.connections.lookup(machine_id).filter(|h| h.is_open()) else {
            debug!(%machine_id, %path, "relay target not connected");
            return false;
        };
        let sent = handle.send(Frame::Relay {
            payload: RelayPayload {
                path: path.to_string(),
                body,
            },
        });
        debug!(%machine_id, %path, sent, "relay queued");
        sent
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(acceptor): State<Arc<HubAcceptor>>) -> Response {
    ws.on_upgrade(move |socket| acceptor.handle_socket(socket))
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Frame(frame) => {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, kind = frame.kind(), "failed to encode frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}
