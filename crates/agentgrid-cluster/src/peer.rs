//! Peer transport — HTTP calls from one hub to another.
//!
//! The router and the hub heartbeat only see [`PeerTransport`], so tests
//! can swap the network for a scripted fake. [`HttpPeers`] is the real
//! implementation: a pooled hyper client, bearer auth from the shared
//! secret, and a timeout around every request.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use agentgrid_core::{
    AgentSummary, ErrorBody, HubAnnouncement, MembersResponse, MessageBody, SpawnRequest,
    SpawnResponse,
};

use crate::error::{ClusterError, ClusterResult};
use crate::registry::PeerHub;

const USER_AGENT: &str = concat!("agentgrid/", env!("CARGO_PKG_VERSION"));

/// Calls a hub makes on its peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// `GET /agents` on `peer`: a bare JSON array of `{id, type}`.
    async fn list_agents(&self, peer: &PeerHub) -> ClusterResult<Vec<AgentSummary>>;

    /// `POST /message` on `peer`. The body never names a target machine,
    /// so the peer delivers locally or through its own edges.
    async fn send_message(&self, peer: &PeerHub, body: &MessageBody) -> ClusterResult<()>;

    /// `POST /spawn` on `peer`.
    async fn spawn(&self, peer: &PeerHub, request: &SpawnRequest) -> ClusterResult<SpawnResponse>;

    /// `POST /stop` on `peer`.
    async fn stop(&self, peer: &PeerHub, agent_id: &str) -> ClusterResult<()>;

    /// `POST /cluster/join` on the hub at `bridge_url`.
    async fn announce(
        &self,
        bridge_url: &str,
        announcement: &HubAnnouncement,
    ) -> ClusterResult<MembersResponse>;

    /// `GET /health` on the hub at `bridge_url`.
    async fn health(&self, bridge_url: &str) -> ClusterResult<()>;
}

/// hyper-backed [`PeerTransport`].
#[derive(Clone)]
pub struct HttpPeers {
    client: Client<HttpConnector, Full<Bytes>>,
    secret: Option<String>,
    timeout: Duration,
}

impl HttpPeers {
    pub fn new(secret: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            secret: secret.filter(|s| !s.is_empty()),
            timeout,
        }
    }

    async fn call<B, R>(
        &self,
        machine: &str,
        method: Method,
        url: String,
        body: Option<&B>,
    ) -> ClusterResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let payload = match body {
            Some(body) => serde_json::to_vec(body)
                .map(Bytes::from)
                .map_err(|e| ClusterError::peer(machine, format!("encode request: {e}")))?,
            None => Bytes::new(),
        };

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(url.as_str())
            .header(header::USER_AGENT, USER_AGENT);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        if let Some(secret) = &self.secret {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {secret}"));
        }
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| ClusterError::peer(machine, format!("build request: {e}")))?;

        debug!(%machine, %method, %url, "peer request");

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ClusterError::peer(machine, e.to_string()))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ClusterError::peer(machine, format!("read body: {e}")))?
                .to_bytes();
            Ok::<_, ClusterError>((status, bytes))
        };

        let (status, bytes) = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClusterError::peer(
                    machine,
                    format!("timed out after {:?}", self.timeout),
                ));
            }
        };

        if !status.is_success() {
            return Err(ClusterError::peer(machine, failure_detail(status, &bytes)));
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| ClusterError::peer(machine, format!("decode response: {e}")))
    }
}

/// `HTTP 404: AGENT_NOT_FOUND: ...` when the peer sent an error body.
fn failure_detail(status: StatusCode, bytes: &[u8]) -> String {
    match serde_json::from_slice::<ErrorBody>(bytes) {
        Ok(body) => format!("HTTP {}: {}", status.as_u16(), body.summary()),
        Err(_) => format!("HTTP {}", status.as_u16()),
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[async_trait]
impl PeerTransport for HttpPeers {
    async fn list_agents(&self, peer: &PeerHub) -> ClusterResult<Vec<AgentSummary>> {
        self.call::<(), _>(
            &peer.machine_id,
            Method::GET,
            join_url(&peer.bridge_url, "/agents"),
            None,
        )
        .await
    }

    async fn send_message(&self, peer: &PeerHub, body: &MessageBody) -> ClusterResult<()> {
        let _: serde_json::Value = self
            .call(
                &peer.machine_id,
                Method::POST,
                join_url(&peer.bridge_url, "/message"),
                Some(body),
            )
            .await?;
        Ok(())
    }

    async fn spawn(&self, peer: &PeerHub, request: &SpawnRequest) -> ClusterResult<SpawnResponse> {
        self.call(
            &peer.machine_id,
            Method::POST,
            join_url(&peer.bridge_url, "/spawn"),
            Some(request),
        )
        .await
    }

    async fn stop(&self, peer: &PeerHub, agent_id: &str) -> ClusterResult<()> {
        let body = serde_json::json!({ "agent_id": agent_id });
        let _: serde_json::Value = self
            .call(
                &peer.machine_id,
                Method::POST,
                join_url(&peer.bridge_url, "/stop"),
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn announce(
        &self,
        bridge_url: &str,
        announcement: &HubAnnouncement,
    ) -> ClusterResult<MembersResponse> {
        self.call(
            bridge_url,
            Method::POST,
            join_url(bridge_url, "/cluster/join"),
            Some(announcement),
        )
        .await
    }

    async fn health(&self, bridge_url: &str) -> ClusterResult<()> {
        let _: serde_json::Value = self
            .call::<(), _>(bridge_url, Method::GET, join_url(bridge_url, "/health"), None)
            .await?;
        Ok(())
    }
}
