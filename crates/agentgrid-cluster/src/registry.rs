//! Membership registry — the in-process table of known machines.
//!
//! Pure data plus accessors. Upserts are whole-record replacements keyed
//! by machine id, so applying the same `welcome` snapshot or
//! `member_joined` gossip twice lands on the same state.

use std::collections::BTreeMap;
use std::sync::RwLock;

use tracing::{debug, info};

use agentgrid_core::{AgentId, ClusterMember, MemberRole, epoch_millis};

/// Who this process is, and the secret it shares with the cluster.
///
/// Constructed once at startup and owned by the [`Registry`].
#[derive(Debug, Clone)]
pub struct ClusterIdentity {
    pub machine_id: String,
    /// `None` runs standalone: joins and HTTP calls are not authenticated.
    pub secret: Option<String>,
}

impl ClusterIdentity {
    pub fn new(machine_id: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            secret: secret.filter(|s| !s.is_empty()),
        }
    }
}

/// A hub this machine can call over HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHub {
    pub machine_id: String,
    pub bridge_url: String,
}

/// Thread-safe table of cluster members keyed by machine id.
pub struct Registry {
    identity: ClusterIdentity,
    members: RwLock<BTreeMap<String, ClusterMember>>,
}

impl Registry {
    pub fn new(identity: ClusterIdentity) -> Self {
        Self {
            identity,
            members: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.identity.machine_id
    }

    pub fn secret(&self) -> Option<&str> {
        self.identity.secret.as_deref()
    }

    /// Whether `candidate` is accepted as the shared secret.
    ///
    /// Always true when no secret is configured.
    pub fn secret_matches(&self, candidate: &str) -> bool {
        match &self.identity.secret {
            Some(secret) => secret == candidate,
            None => true,
        }
    }

    /// Add or replace a member. Always stamps `last_seen` with now.
    pub fn add_member(&self, mut member: ClusterMember) {
        member.last_seen = epoch_millis();
        let machine_id = member.machine_id.clone();
        let role = member.role;

        let mut members = self.members.write().expect("members lock");
        let replaced = members.insert(machine_id.clone(), member).is_some();
        drop(members);

        if replaced {
            debug!(%machine_id, ?role, "member updated");
        } else {
            info!(%machine_id, ?role, "member joined");
        }
    }

    /// Remove a member. Returns the removed record, if any.
    pub fn remove_member(&self, machine_id: &str) -> Option<ClusterMember> {
        let removed = self
            .members
            .write()
            .expect("members lock")
            .remove(machine_id);
        if removed.is_some() {
            info!(%machine_id, "member left");
        }
        removed
    }

    pub fn get_member(&self, machine_id: &str) -> Option<ClusterMember> {
        self.members
            .read()
            .expect("members lock")
            .get(machine_id)
            .cloned()
    }

    /// All members, ordered by machine id.
    pub fn members(&self) -> Vec<ClusterMember> {
        self.members
            .read()
            .expect("members lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn hubs(&self) -> Vec<ClusterMember> {
        self.members
            .read()
            .expect("members lock")
            .values()
            .filter(|m| m.role == MemberRole::Hub)
            .cloned()
            .collect()
    }

    /// Bump `last_seen` without other changes. Returns false for unknown ids.
    pub fn touch(&self, machine_id: &str) -> bool {
        let mut members = self.members.write().expect("members lock");
        match members.get_mut(machine_id) {
            Some(member) => {
                member.last_seen = member.last_seen.max(epoch_millis());
                true
            }
            None => false,
        }
    }

    /// Replace a member's agent list. Returns false for unknown ids.
    pub fn update_agents(&self, machine_id: &str, agents: Vec<AgentId>) -> bool {
        let mut members = self.members.write().expect("members lock");
        match members.get_mut(machine_id) {
            Some(member) => {
                debug!(%machine_id, count = agents.len(), "agents updated");
                member.agents = agents;
                member.last_seen = member.last_seen.max(epoch_millis());
                true
            }
            None => false,
        }
    }

    /// Hubs with a bridge URL, excluding this machine.
    ///
    /// These are the "other machines I can call over HTTP".
    pub fn reachable_hubs(&self) -> Vec<PeerHub> {
        self.members
            .read()
            .expect("members lock")
            .values()
            .filter(|m| m.role == MemberRole::Hub && m.machine_id != self.identity.machine_id)
            .filter_map(|m| {
                m.bridge_url.as_ref().map(|url| PeerHub {
                    machine_id: m.machine_id.clone(),
                    bridge_url: url.clone(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().expect("members lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(ClusterIdentity::new("hub-1", Some("s3cret".into())))
    }

    #[test]
    fn upsert_replaces_whole_record() {
        let reg = registry();
        let mut first = ClusterMember::hub("hub-2", "http://10.0.0.2:9100", vec!["generic".into()]);
        first.agents = vec!["w1".into()];
        reg.add_member(first);

        let second = ClusterMember::hub("hub-2", "http://10.0.0.9:9100", Vec::new());
        reg.add_member(second);

        let member = reg.get_member("hub-2").unwrap();
        assert_eq!(member.bridge_url.as_deref(), Some("http://10.0.0.9:9100"));
        assert!(member.capabilities.is_empty());
        assert!(member.agents.is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn add_member_stamps_last_seen() {
        let reg = registry();
        let mut member = ClusterMember::edge("edge-1", "hub-1", Vec::new());
        member.last_seen = 5;
        reg.add_member(member);
        assert!(reg.get_member("edge-1").unwrap().last_seen > 5);
    }

    #[test]
    fn remove_and_get() {
        let reg = registry();
        reg.add_member(ClusterMember::edge("edge-1", "hub-1", Vec::new()));
        assert!(reg.remove_member("edge-1").is_some());
        assert!(reg.get_member("edge-1").is_none());
        assert!(reg.remove_member("edge-1").is_none());
    }

    #[test]
    fn touch_and_update_agents_ignore_unknown() {
        let reg = registry();
        assert!(!reg.touch("ghost"));
        assert!(!reg.update_agents("ghost", vec!["a".into()]));
        assert!(reg.is_empty());
    }

    #[test]
    fn update_agents_is_full_replace() {
        let reg = registry();
        reg.add_member(ClusterMember::edge("edge-1", "hub-1", Vec::new()));
        reg.update_agents("edge-1", vec!["a".into(), "b".into()]);
        reg.update_agents("edge-1", vec!["c".into()]);
        assert_eq!(reg.get_member("edge-1").unwrap().agents, vec!["c".to_string()]);
    }

    #[test]
    fn touch_never_moves_backwards() {
        let reg = registry();
        reg.add_member(ClusterMember::edge("edge-1", "hub-1", Vec::new()));
        let before = reg.get_member("edge-1").unwrap().last_seen;
        assert!(reg.touch("edge-1"));
        assert!(reg.get_member("edge-1").unwrap().last_seen >= before);
    }

    #[test]
    fn reachable_hubs_excludes_self_edges_and_urlless() {
        let reg = registry();
        reg.add_member(ClusterMember::hub("hub-1", "http://self:9100", Vec::new()));
        reg.add_member(ClusterMember::hub("hub-2", "http://10.0.0.2:9100", Vec::new()));
        let mut bare = ClusterMember::hub("hub-3", "unused", Vec::new());
        bare.bridge_url = None;
        reg.add_member(bare);
        reg.add_member(ClusterMember::edge("edge-1", "hub-1", Vec::new()));

        let peers = reg.reachable_hubs();
        assert_eq!(
            peers,
            vec![PeerHub {
                machine_id: "hub-2".into(),
                bridge_url: "http://10.0.0.2:9100".into(),
            }]
        );
        assert_eq!(reg.hubs().len(), 3);
    }

    #[test]
    fn secret_matching() {
        let reg = registry();
        assert!(reg.secret_matches("s3cret"));
        assert!(!reg.secret_matches("wrong"));

        let open = Registry::new(ClusterIdentity::new("hub-1", Some(String::new())));
        assert!(open.secret().is_none());
        assert!(open.secret_matches("anything"));
    }

    #[test]
    fn concurrent_upserts_stay_consistent() {
        let reg = std::sync::Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("edge-{}", i % 10);
                        reg.add_member(ClusterMember::edge(id.clone(), format!("hub-{t}"), Vec::new()));
                        reg.touch(&id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 10);
        for member in reg.members() {
            assert!(member.connected_hub.as_deref().unwrap().starts_with("hub-"));
        }
    }
}
