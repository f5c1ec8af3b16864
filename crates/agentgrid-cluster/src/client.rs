//! Edge client — outbound side of the cluster WebSocket.
//!
//! Runs on machines without a public address. Dials one hub, presents
//! the shared secret, and keeps the tunnel alive with pings. When the
//! tunnel drops the client moves to the next known hub and retries with
//! exponential backoff until it joins again or is told to stop.
//!
//! ```text
//! connect_once
//!   ├── dial (bounded by connect_timeout)
//!   ├── send join, register handshake id
//!   └── wait welcome | error | timeout
//! session
//!   ├── welcome      → registry snapshot, learn hubs, attach outbound
//!   ├── pong         → missed = 0
//!   ├── relay        → relay handler
//!   ├── member_*     → registry
//!   └── ping tick    → missed >= max ? close : ping
//! on close (after join) → reconnect loop
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agentgrid_core::{ClusterMember, TimingConfig};

use crate::backoff::{ReconnectPolicy, ws_url};
use crate::connections::Outbound;
use crate::error::{ClusterError, ClusterResult};
use crate::pending::{PendingError, PendingTable};
use crate::protocol::{Frame, RelayPayload};
use crate::registry::Registry;

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback invoked for every `relay` envelope the hub forwards.
pub type RelayHandler = Arc<dyn Fn(RelayPayload) + Send + Sync>;

/// Edge client settings.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Hub addresses to try, in order. Replaced by what `welcome` teaches.
    pub hubs: Vec<String>,
    pub capabilities: Vec<String>,
    pub ping_interval: Duration,
    pub max_missed_pongs: u32,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl EdgeConfig {
    pub fn new(hubs: Vec<String>) -> Self {
        Self::from_timing(hubs, &TimingConfig::default())
    }

    pub fn from_timing(hubs: Vec<String>, timing: &TimingConfig) -> Self {
        Self {
            hubs,
            capabilities: Vec::new(),
            ping_interval: timing.ping_interval(),
            max_missed_pongs: timing.max_missed_pongs,
            reconnect_initial: timing.reconnect_initial(),
            reconnect_max: timing.reconnect_max(),
            connect_timeout: timing.connect_timeout(),
            handshake_timeout: timing.handshake_timeout(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_max_missed_pongs(mut self, max: u32) -> Self {
        self.max_missed_pongs = max;
        self
    }

    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial = initial;
        self.reconnect_max = max;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Handle to the edge's tunnel. Cheap to clone.
#[derive(Clone)]
pub struct EdgeClient {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    config: EdgeConfig,
    policy: Mutex<ReconnectPolicy>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    connected: AtomicBool,
    relay_handler: RwLock<Option<RelayHandler>>,
    shutdown: watch::Sender<bool>,
}

impl EdgeClient {
    pub fn new(registry: Arc<Registry>, config: EdgeConfig) -> Self {
        let policy = ReconnectPolicy::new(
            config.hubs.clone(),
            config.reconnect_initial,
            config.reconnect_max,
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                policy: Mutex::new(policy),
                outbound: Mutex::new(None),
                connected: AtomicBool::new(false),
                relay_handler: RwLock::new(None),
                shutdown,
            }),
        }
    }

    /// Install the callback for relayed requests. Replaces any previous one.
    pub fn set_relay_handler(&self, handler: RelayHandler) {
        *self
            .inner
            .relay_handler
            .write()
            .expect("relay handler lock") = Some(handler);
    }

    /// Dial the current hub and complete the join handshake.
    ///
    /// Fails with [`ClusterError::Rejected`] if the hub answers with an
    /// error frame. No reconnect is scheduled for a failed first attempt.
    pub async fn connect(&self) -> ClusterResult<()> {
        self.inner.connect_once().await
    }

    /// Like [`connect`](Self::connect), but hands transport failures to
    /// the background reconnect loop instead of returning them.
    ///
    /// A rejected join is still returned: retrying with the same secret
    /// cannot succeed.
    pub async fn start(&self) -> ClusterResult<()> {
        match self.inner.connect_once().await {
            Ok(()) => Ok(()),
            Err(e @ ClusterError::Rejected { .. }) => Err(e),
            Err(e) => {
                warn!(error = %e, "initial hub connection failed, retrying in background");
                self.inner.schedule_reconnect();
                Ok(())
            }
        }
    }

    /// Close the tunnel and stop reconnecting.
    pub fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
        if let Some(tx) = self.inner.outbound.lock().expect("outbound lock").take() {
            let _ = tx.send(Outbound::Close);
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        info!("edge client disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Report this machine's agent ids to the hub. Fire-and-forget.
    pub fn sync_agents(&self, agents: Vec<String>) -> bool {
        let frame = Frame::AgentsSync {
            machine_id: self.inner.registry.self_id().to_string(),
            agents,
        };
        self.inner.send(frame)
    }

    /// Hubs the client will rotate through on reconnect.
    pub fn hub_addresses(&self) -> Vec<String> {
        self.inner
            .policy
            .lock()
            .expect("policy lock")
            .addresses()
            .to_vec()
    }
}

impl Inner {
    fn send(&self, frame: Frame) -> bool {
        match self.outbound.lock().expect("outbound lock").as_ref() {
            Some(tx) => tx.send(Outbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn connect_once(self: &Arc<Self>) -> ClusterResult<()> {
        let hub = self
            .policy
            .lock()
            .expect("policy lock")
            .current()
            .map(str::to_string)
            .ok_or(ClusterError::NoHubs)?;
        let url = ws_url(&hub);
        if url.parse::<http::Uri>().is_err() {
            return Err(ClusterError::InvalidAddress { address: hub });
        }

        debug!(%hub, %url, "dialing hub");
        let socket = match tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => {
                return Err(ClusterError::Connect {
                    hub,
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(ClusterError::ConnectTimeout { hub }),
        };

        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, rx));

        let pending = Arc::new(PendingTable::new());
        let handshake = Uuid::new_v4().to_string();
        let waiter = pending.register(handshake.clone());

        let join = Frame::Join {
            secret: self.registry.secret().unwrap_or_default().to_string(),
            machine_id: self.registry.self_id().to_string(),
            capabilities: self.config.capabilities.clone(),
        };
        let _ = tx.send(Outbound::Frame(join));

        let session = Session {
            inner: Arc::clone(self),
            hub: hub.clone(),
            tx: tx.clone(),
            pending: Arc::clone(&pending),
            handshake,
        };
        tokio::spawn(session.run(stream));

        match waiter.wait(&pending, self.config.handshake_timeout).await {
            Ok(hub_id) => {
                info!(%hub, %hub_id, "joined cluster");
                Ok(())
            }
            Err(PendingError::Rejected { code, message }) => {
                Err(ClusterError::Rejected { code, message })
            }
            Err(PendingError::TimedOut) => {
                warn!(%hub, timeout = ?self.config.handshake_timeout, "no welcome from hub, closing");
                let _ = tx.send(Outbound::Close);
                Err(ClusterError::HandshakeTimeout { hub })
            }
            Err(PendingError::Closed) => Err(ClusterError::Closed),
        }
    }

    /// Apply a `welcome` snapshot and learn the hubs it names.
    fn apply_welcome(&self, members: Vec<ClusterMember>, hub_id: &str) {
        let self_id = self.registry.self_id();
        let mut hub_urls = Vec::new();
        let mut current_url = None;
        for member in members {
            if member.is_hub() {
                if let Some(url) = member.bridge_url.clone() {
                    if member.machine_id == hub_id {
                        current_url = Some(url.clone());
                    }
                    hub_urls.push(url);
                }
            }
            if member.machine_id != self_id {
                self.registry.add_member(member);
            }
        }

        let mut policy = self.policy.lock().expect("policy lock");
        if !hub_urls.is_empty() {
            debug!(hubs = ?hub_urls, "learned hub addresses");
            policy.learn(hub_urls);
            if let Some(url) = current_url {
                policy.select(&url);
            }
        }
        policy.reset();
    }

    fn attach(&self, tx: &mpsc::UnboundedSender<Outbound>) {
        *self.outbound.lock().expect("outbound lock") = Some(tx.clone());
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Forget `tx` if it is still the active tunnel.
    fn detach(&self, tx: &mpsc::UnboundedSender<Outbound>) {
        let mut outbound = self.outbound.lock().expect("outbound lock");
        if outbound.as_ref().is_some_and(|cur| cur.same_channel(tx)) {
            *outbound = None;
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    fn dispatch_relay(&self, payload: RelayPayload) {
        let handler = self
            .relay_handler
            .read()
            .expect("relay handler lock")
            .clone();
        match handler {
            Some(handler) => {
                debug!(path = %payload.path, "relay received");
                handler(payload);
            }
            None => warn!(path = %payload.path, "relay received with no handler installed"),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.stopping() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.reconnect_loop().await });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let (hub, delay) = {
                let mut policy = self.policy.lock().expect("policy lock");
                let hub = policy.advance().unwrap_or_default().to_string();
                (hub, policy.delay())
            };
            info!(%hub, ?delay, "reconnecting to cluster");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            if self.stopping() {
                return;
            }

            match self.connect_once().await {
                Ok(()) => return,
                Err(e) => {
                    warn!(%hub, error = %e, "reconnect attempt failed");
                    self.policy.lock().expect("policy lock").record_failure();
                }
            }
        }
    }
}

/// One live tunnel, from dial to close.
struct Session {
    inner: Arc<Inner>,
    hub: String,
    tx: mpsc::UnboundedSender<Outbound>,
    pending: Arc<PendingTable<String>>,
    handshake: String,
}

impl Session {
    async fn run(self, mut stream: SplitStream<HubSocket>) {
        let period = self.inner.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.inner.shutdown.subscribe();

        let mut joined = false;
        let mut missed: u32 = 0;

        loop {
            tokio::select! {
                next = stream.next() => {
                    let text = match next {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(hub = %self.hub, error = %e, "hub socket error");
                            break;
                        }
                    };
                    let Some(frame) = Frame::decode(text.as_str()) else {
                        debug!(hub = %self.hub, "dropping malformed frame");
                        continue;
                    };
                    match frame {
                        Frame::Welcome { members, hub_id } => {
                            self.inner.apply_welcome(members, &hub_id);
                            if joined {
                                continue;
                            }
                            self.inner.attach(&self.tx);
                            if self.pending.complete(&self.handshake, Ok(hub_id)) {
                                joined = true;
                                missed = 0;
                                ping.reset();
                            } else {
                                debug!(hub = %self.hub, "welcome arrived after the handshake was abandoned");
                                self.inner.detach(&self.tx);
                                break;
                            }
                        }
                        Frame::Error { code, message } => {
                            error!(hub = %self.hub, %code, %message, "hub reported error");
                            if !joined {
                                self.pending.complete(
                                    &self.handshake,
                                    Err(PendingError::Rejected { code, message }),
                                );
                                break;
                            }
                        }
                        Frame::Pong => missed = 0,
                        Frame::Relay { payload } => self.inner.dispatch_relay(payload),
                        Frame::MemberJoined { member } => {
                            if member.machine_id != self.inner.registry.self_id() {
                                self.inner.registry.add_member(member);
                            }
                        }
                        Frame::MemberLeft { machine_id } => {
                            self.inner.registry.remove_member(&machine_id);
                        }
                        other => debug!(kind = other.kind(), "ignoring unexpected frame from hub"),
                    }
                }
                _ = ping.tick(), if joined => {
                    if missed >= self.inner.config.max_missed_pongs {
                        warn!(hub = %self.hub, missed, "hub stopped answering pings, closing");
                        break;
                    }
                    missed += 1;
                    if self.tx.send(Outbound::Frame(Frame::Ping)).is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        let _ = self.tx.send(Outbound::Close);
        self.pending.fail_all(PendingError::Closed);

        if joined {
            self.inner.detach(&self.tx);
            if !self.inner.stopping() {
                info!(hub = %self.hub, "hub connection lost");
                self.inner.schedule_reconnect();
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<HubSocket, Message>,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClusterIdentity;

    fn client(hubs: &[&str]) -> EdgeClient {
        let registry = Arc::new(Registry::new(ClusterIdentity::new(
            "edge-1",
            Some("s".to_string()),
        )));
        EdgeClient::new(
            registry,
            EdgeConfig::new(hubs.iter().map(|s| s.to_string()).collect()),
        )
    }

    fn hub(id: &str, url: &str) -> ClusterMember {
        ClusterMember::hub(id, url, Vec::new())
    }

    #[test]
    fn config_follows_timing() {
        let timing = TimingConfig {
            ping_interval_secs: 5,
            max_missed_pongs: 2,
            ..TimingConfig::default()
        };
        let config = EdgeConfig::from_timing(vec!["h".into()], &timing);
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.max_missed_pongs, 2);
        assert_eq!(config.reconnect_max, Duration::from_secs(30));
    }

    #[test]
    fn not_connected_before_join() {
        let c = client(&["http://h1:9100"]);
        assert!(!c.is_connected());
        assert!(!c.sync_agents(vec!["w1".into()]));
    }

    #[test]
    fn welcome_teaches_hubs_and_skips_self() {
        let c = client(&["http://seed:9100"]);
        let members = vec![
            hub("hub-1", "http://h1:9100"),
            hub("hub-2", "http://h2:9100"),
            ClusterMember::edge("edge-1", "hub-1", Vec::new()),
            ClusterMember::edge("edge-2", "hub-1", Vec::new()),
        ];
        c.inner.apply_welcome(members, "hub-1");

        assert_eq!(c.hub_addresses(), vec!["http://h1:9100", "http://h2:9100"]);
        assert!(c.inner.registry.get_member("edge-1").is_none());
        assert!(c.inner.registry.get_member("edge-2").is_some());

        // Positioned on hub-1, so the first failover goes to hub-2.
        let mut policy = c.inner.policy.lock().unwrap();
        assert_eq!(policy.advance(), Some("http://h2:9100"));
    }

    #[test]
    fn welcome_without_hub_urls_keeps_seed() {
        let c = client(&["http://seed:9100"]);
        c.inner
            .apply_welcome(vec![ClusterMember::edge("edge-2", "hub-1", Vec::new())], "hub-1");
        assert_eq!(c.hub_addresses(), vec!["http://seed:9100"]);
    }

    #[test]
    fn detach_ignores_stale_channel() {
        let c = client(&["http://h1:9100"]);
        let (old, _old_rx) = mpsc::unbounded_channel();
        let (new, _new_rx) = mpsc::unbounded_channel();
        c.inner.attach(&new);
        c.inner.detach(&old);
        assert!(c.is_connected());
        c.inner.detach(&new);
        assert!(!c.is_connected());
    }

    #[test]
    fn relay_reaches_installed_handler() {
        let c = client(&["http://h1:9100"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        c.set_relay_handler(Arc::new(move |payload: RelayPayload| {
            sink.lock().unwrap().push(payload.path);
        }));
        c.inner.dispatch_relay(RelayPayload {
            path: "/message".into(),
            body: serde_json::json!({}),
        });
        assert_eq!(*seen.lock().unwrap(), vec!["/message".to_string()]);
    }

    #[tokio::test]
    async fn connect_without_hubs_fails() {
        let c = client(&[]);
        assert!(matches!(c.connect().await, Err(ClusterError::NoHubs)));
    }

    #[tokio::test]
    async fn connect_rejects_garbage_address() {
        let c = client(&["http://bad host:9100"]);
        assert!(matches!(
            c.connect().await,
            Err(ClusterError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let hub = format!("http://{addr}");
        let c = client(&[hub.as_str()]);
        let err = c.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Connect { .. } | ClusterError::ConnectTimeout { .. }
        ));
        assert!(!c.is_connected());
    }
}
