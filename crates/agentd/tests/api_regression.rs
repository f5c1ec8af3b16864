//! API regression tests.
//!
//! Drives the full router built by `build_router` (bearer middleware
//! included) through `oneshot`, the way a hub assembles it.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use agentgrid_api::{ApiState, build_router};
use agentgrid_cluster::{ClusterIdentity, HttpPeers, HubAcceptor, HubHeartbeat, Registry};
use agentgrid_core::ClusterMember;
use agentgrid_router::{MemoryAdapter, Router};

const SECRET: &str = "S";

struct TestHub {
    app: axum::Router,
    memory: Arc<MemoryAdapter>,
    registry: Arc<Registry>,
}

fn test_hub(secret: Option<&str>) -> TestHub {
    let registry = Arc::new(Registry::new(ClusterIdentity::new(
        "hub-1",
        secret.map(str::to_string),
    )));
    registry.add_member(ClusterMember::hub(
        "hub-1",
        "http://127.0.0.1:9100",
        vec!["generic".to_string()],
    ));

    let peers = Arc::new(HttpPeers::new(
        secret.map(str::to_string),
        Duration::from_millis(300),
    ));
    let acceptor = Arc::new(HubAcceptor::new(registry.clone()));
    let heartbeat = Arc::new(HubHeartbeat::new(
        registry.clone(),
        peers.clone(),
        Duration::from_secs(3600),
    ));
    let memory = Arc::new(MemoryAdapter::new().with_agent("w1"));
    let router = Router::new(registry.clone(), peers)
        .with_relay(acceptor.clone())
        .with_adapter(memory.clone());

    let state = ApiState::new(Arc::new(router)).with_hub(acceptor, heartbeat);
    TestHub {
        app: build_router(state),
        memory,
        registry,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {SECRET}"))
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {SECRET}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(resp: Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ── Auth ───────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_header_is_auth_required() {
    let hub = test_hub(Some(SECRET));
    let req = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let resp = hub.app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(resp).await;
    assert_eq!(body["error_code"], "AUTH_REQUIRED");
    assert_eq!(body["error"], "Missing Authorization header");
}

#[tokio::test]
async fn wrong_secret_is_auth_failed() {
    let hub = test_hub(Some(SECRET));
    let req = Request::builder()
        .uri("/agents")
        .header("authorization", "Bearer nope")
        .body(Body::empty())
        .unwrap();

    let resp = hub.app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(resp).await["error_code"], "AUTH_FAILED");
}

#[tokio::test]
async fn no_secret_means_open_api() {
    let hub = test_hub(None);
    let req = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let resp = hub.app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["machine_id"], "hub-1");
}

#[tokio::test]
async fn cluster_ws_skips_bearer_auth() {
    let hub = test_hub(Some(SECRET));
    // Not an upgrade request, but it must reach the WebSocket route
    // rather than be turned away by the middleware.
    let req = Request::builder()
        .uri("/cluster/ws")
        .body(Body::empty())
        .unwrap();

    let resp = hub.app.oneshot(req).await.unwrap();
    assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ── Agents ─────────────────────────────────────────────────────────

#[tokio::test]
async fn agents_is_a_bare_array() {
    let hub = test_hub(Some(SECRET));
    let resp = hub.app.oneshot(get("/agents")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp).await;
    let agents = body.as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["id"], "w1");
    assert_eq!(agents[0]["type"], "generic");
}

#[tokio::test]
async fn message_delivers_locally() {
    let hub = test_hub(Some(SECRET));
    let resp = hub
        .app
        .oneshot(post(
            "/message",
            json!({"agent_id": "w1", "from": "lead", "message": "go"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, json!({"ok": true}));

    let inbox = hub.memory.inbox("w1");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].from, "lead");
}

#[tokio::test]
async fn message_to_self_stays_local() {
    let hub = test_hub(Some(SECRET));
    let resp = hub
        .app
        .oneshot(post(
            "/message",
            json!({"agent_id": "w1", "message": "hi", "machine": "hub-1"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(hub.memory.inbox("w1")[0].from, "anonymous");
}

#[tokio::test]
async fn unparseable_message_is_missing_fields() {
    let hub = test_hub(Some(SECRET));
    let req = Request::builder()
        .method("POST")
        .uri("/message")
        .header("authorization", format!("Bearer {SECRET}"))
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let resp = hub.app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error_code"], "MISSING_FIELDS");
}

#[tokio::test]
async fn unknown_agent_with_no_peers_is_not_found() {
    let hub = test_hub(Some(SECRET));
    let resp = hub
        .app
        .oneshot(post("/message", json!({"agent_id": "ghost", "message": "hi"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(resp).await["error_code"], "AGENT_NOT_FOUND");
}

#[tokio::test]
async fn disconnected_edge_target_is_unreachable() {
    let hub = test_hub(Some(SECRET));
    hub.registry
        .add_member(ClusterMember::edge("edge-1", "hub-1", Vec::<String>::new()));

    let resp = hub
        .app
        .oneshot(post(
            "/message",
            json!({"agent_id": "w9", "message": "hi", "machine": "edge-1"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(resp).await;
    assert_eq!(body["error_code"], "REMOTE_UNREACHABLE");
    assert_eq!(body["error"], "Machine edge-1 unreachable");
}

#[tokio::test]
async fn spawn_locate_stop_flow() {
    let hub = test_hub(Some(SECRET));

    let resp = hub
        .app
        .clone()
        .oneshot(post(
            "/spawn",
            json!({"type": "generic", "task": "index the repo", "agent_id": "w2"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let spawned = json_body(resp).await;
    assert_eq!(spawned["ok"], true);
    assert_eq!(spawned["machine"], "hub-1");

    let resp = hub
        .app
        .clone()
        .oneshot(get("/locate?agent_id=w2"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["machine"], "hub-1");

    let resp = hub
        .app
        .clone()
        .oneshot(post("/stop", json!({"agent_id": "w2"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = hub.app.oneshot(get("/locate?agent_id=w2")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn locate_without_id_is_missing_fields() {
    let hub = test_hub(Some(SECRET));
    let resp = hub.app.oneshot(get("/locate")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"], "agent_id is required");
}

// ── Cluster ────────────────────────────────────────────────────────

#[tokio::test]
async fn cluster_join_then_members() {
    let hub = test_hub(Some(SECRET));

    let resp = hub
        .app
        .clone()
        .oneshot(post(
            "/cluster/join",
            json!({"machine_id": "hub-2", "bridge_url": "http://127.0.0.1:1"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = hub.app.oneshot(get("/cluster/members")).await.unwrap();
    let body = json_body(resp).await;
    let members = body["members"].as_array().unwrap();
    assert_eq!(members.len(), 2);
    assert!(
        members
            .iter()
            .any(|m| m["machine_id"] == "hub-2" && m["role"] == "hub")
    );
}
