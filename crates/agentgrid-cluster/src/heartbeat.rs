//! Hub heartbeat — background liveness checks between hubs.
//!
//! One task per peer hub polls `GET {bridge_url}/health`. A success
//! refreshes the peer's `last_seen`; a failure is logged and the peer
//! stays in the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agentgrid_core::ClusterMember;

use crate::peer::PeerTransport;
use crate::registry::Registry;

struct HeartbeatSlot {
    url: String,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Runs one heartbeat loop per peer hub.
pub struct HubHeartbeat {
    registry: Arc<Registry>,
    peers: Arc<dyn PeerTransport>,
    interval: Duration,
    /// machine_id → slot.
    slots: RwLock<HashMap<String, HeartbeatSlot>>,
}

impl HubHeartbeat {
    pub fn new(registry: Arc<Registry>, peers: Arc<dyn PeerTransport>, interval: Duration) -> Self {
        Self {
            registry,
            peers,
            interval,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Start polling `member`. No-op for this machine, for members without
    /// a bridge URL, and for peers already polled at the same URL. A peer
    /// that moved has its old loop replaced.
    pub async fn start(&self, member: &ClusterMember) -> bool {
        if member.machine_id == self.registry.self_id() {
            return false;
        }
        let Some(url) = member.bridge_url.clone() else {
            return false;
        };

        let mut slots = self.slots.write().await;
        if slots.get(&member.machine_id).is_some_and(|slot| slot.url == url) {
            return false;
        }
        if let Some(old) = slots.remove(&member.machine_id) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
            info!(machine_id = %member.machine_id, old_url = %old.url, %url, "hub moved, restarting heartbeat");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let machine_id = member.machine_id.clone();
        let registry = Arc::clone(&self.registry);
        let peers = Arc::clone(&self.peers);
        let interval = self.interval;

        let target = url.clone();
        let handle = tokio::spawn(async move {
            run_heartbeat(&machine_id, &target, interval, registry, peers, shutdown_rx).await;
        });

        slots.insert(
            member.machine_id.clone(),
            HeartbeatSlot {
                url,
                handle,
                shutdown_tx,
            },
        );
        info!(machine_id = %member.machine_id, ?interval, "hub heartbeat started");
        true
    }

    pub async fn stop(&self, machine_id: &str) {
        if let Some(slot) = self.slots.write().await.remove(machine_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%machine_id, "hub heartbeat stopped");
        }
    }

    /// Stop every loop (graceful shutdown).
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        for (id, slot) in slots.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(machine_id = %id, "hub heartbeat stopped");
        }
    }

    /// Machine ids currently being polled.
    pub async fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

async fn run_heartbeat(
    machine_id: &str,
    url: &str,
    interval: Duration,
    registry: Arc<Registry>,
    peers: Arc<dyn PeerTransport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match peers.health(url).await {
                    Ok(()) => {
                        registry.touch(machine_id);
                        debug!(%machine_id, "hub heartbeat ok");
                    }
                    Err(e) => warn!(%machine_id, error = %e, "hub heartbeat failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use agentgrid_core::{
        AgentSummary, HubAnnouncement, MembersResponse, MessageBody, SpawnRequest, SpawnResponse,
    };

    use crate::error::{ClusterError, ClusterResult};
    use crate::registry::{ClusterIdentity, PeerHub};

    /// Answers health checks; fails them when `healthy` is false.
    struct FakePeers {
        healthy: bool,
        checks: AtomicUsize,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerTransport for FakePeers {
        async fn list_agents(&self, _: &PeerHub) -> ClusterResult<Vec<AgentSummary>> {
            Ok(Vec::new())
        }
        async fn send_message(&self, _: &PeerHub, _: &MessageBody) -> ClusterResult<()> {
            Ok(())
        }
        async fn spawn(&self, peer: &PeerHub, _: &SpawnRequest) -> ClusterResult<SpawnResponse> {
            Err(ClusterError::peer(&peer.machine_id, "unsupported"))
        }
        async fn stop(&self, _: &PeerHub, _: &str) -> ClusterResult<()> {
            Ok(())
        }
        async fn announce(&self, _: &str, _: &HubAnnouncement) -> ClusterResult<MembersResponse> {
            Ok(MembersResponse { members: Vec::new() })
        }
        async fn health(&self, url: &str) -> ClusterResult<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            if self.healthy {
                Ok(())
            } else {
                Err(ClusterError::peer(url, "connection refused"))
            }
        }
    }

    fn setup(healthy: bool) -> (Arc<Registry>, Arc<FakePeers>, HubHeartbeat) {
        let registry = Arc::new(Registry::new(ClusterIdentity::new("hub-1", None)));
        let peers = Arc::new(FakePeers {
            healthy,
            checks: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        });
        let heartbeat = HubHeartbeat::new(
            Arc::clone(&registry),
            peers.clone(),
            Duration::from_millis(20),
        );
        (registry, peers, heartbeat)
    }

    #[tokio::test]
    async fn start_skips_self_and_urlless_members() {
        let (_registry, _peers, heartbeat) = setup(true);
        assert!(!heartbeat.start(&ClusterMember::hub("hub-1", "http://h1", Vec::new())).await);
        assert!(!heartbeat.start(&ClusterMember::edge("edge-1", "hub-1", Vec::new())).await);
        assert!(heartbeat.start(&ClusterMember::hub("hub-2", "http://h2", Vec::new())).await);
        assert!(!heartbeat.start(&ClusterMember::hub("hub-2", "http://h2", Vec::new())).await);
        assert_eq!(heartbeat.active().await, vec!["hub-2".to_string()]);
        heartbeat.stop_all().await;
        assert!(heartbeat.active().await.is_empty());
    }

    #[tokio::test]
    async fn healthy_peer_gets_touched() {
        let (registry, peers, heartbeat) = setup(true);
        let hub2 = ClusterMember::hub("hub-2", "http://h2", Vec::new());
        registry.add_member(hub2.clone());
        let before = registry.get_member("hub-2").unwrap().last_seen;

        heartbeat.start(&hub2).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        heartbeat.stop("hub-2").await;

        assert!(peers.checks.load(Ordering::SeqCst) >= 2);
        assert!(registry.get_member("hub-2").unwrap().last_seen >= before);
    }

    #[tokio::test]
    async fn failing_peer_stays_registered() {
        let (registry, peers, heartbeat) = setup(false);
        let hub2 = ClusterMember::hub("hub-2", "http://h2", Vec::new());
        registry.add_member(hub2.clone());

        heartbeat.start(&hub2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        heartbeat.stop_all().await;

        assert!(peers.checks.load(Ordering::SeqCst) >= 1);
        assert!(registry.get_member("hub-2").is_some());
    }

    #[tokio::test]
    async fn moved_peer_is_polled_at_new_url() {
        let (_registry, peers, heartbeat) = setup(true);
        assert!(heartbeat.start(&ClusterMember::hub("hub-2", "http://old", Vec::new())).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(heartbeat.start(&ClusterMember::hub("hub-2", "http://new", Vec::new())).await);
        peers.urls.lock().unwrap().clear();
        tokio::time::sleep(Duration::from_millis(100)).await;
        heartbeat.stop_all().await;

        let urls = peers.urls.lock().unwrap().clone();
        assert!(!urls.is_empty());
        assert!(urls.iter().all(|u| u == "http://new"));
    }
}
