//! Machine-id → edge connection map.
//!
//! The acceptor never touches raw sockets outside the connection task.
//! Each connection owns a writer task; everyone else talks to it through
//! an [`EdgeHandle`] wrapping that task's channel.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::protocol::Frame;

/// Locally unique id of one accepted socket.
pub type ConnectionId = u64;

/// Instructions for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    /// Flush what is queued, send a close frame, and stop.
    Close,
}

/// Cheap, cloneable sender for one live connection.
#[derive(Debug, Clone)]
pub struct EdgeHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl EdgeHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// False once the writer task has stopped.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame. Returns false if the connection is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Narrow interface over the shared connection table.
pub trait ConnectionMap: Send + Sync {
    /// Record `handle` for `machine_id`, returning any handle it replaced.
    fn register(&self, machine_id: &str, handle: EdgeHandle) -> Option<EdgeHandle>;

    /// Drop the mapping, but only if it still points at `connection`.
    fn unregister(&self, machine_id: &str, connection: ConnectionId) -> bool;

    fn lookup(&self, machine_id: &str) -> Option<EdgeHandle>;

    fn for_each_open(&self, f: &mut dyn FnMut(&str, &EdgeHandle));
}

/// `RwLock<HashMap>` implementation of [`ConnectionMap`].
#[derive(Default)]
pub struct InMemoryConnections {
    edges: RwLock<HashMap<String, EdgeHandle>>,
}

impl InMemoryConnections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionMap for InMemoryConnections {
    fn register(&self, machine_id: &str, handle: EdgeHandle) -> Option<EdgeHandle> {
        self.edges
            .write()
            .expect("edges lock")
            .insert(machine_id.to_string(), handle)
    }

    fn unregister(&self, machine_id: &str, connection: ConnectionId) -> bool {
        let mut edges = self.edges.write().expect("edges lock");
        match edges.get(machine_id) {
            Some(handle) if handle.id() == connection => {
                edges.remove(machine_id);
                true
            }
            _ => false,
        }
    }

    fn lookup(&self, machine_id: &str) -> Option<EdgeHandle> {
        self.edges.read().expect("edges lock").get(machine_id).cloned()
    }

    fn for_each_open(&self, f: &mut dyn FnMut(&str, &EdgeHandle)) {
        let edges = self.edges.read().expect("edges lock");
        for (id, handle) in edges.iter().filter(|(_, h)| h.is_open()) {
            f(id, handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: ConnectionId) -> (EdgeHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EdgeHandle::new(id, tx), rx)
    }

    #[test]
    fn unregister_ignores_stale_connection() {
        let map = InMemoryConnections::new();
        let (old, _old_rx) = handle(1);
        let (new, _new_rx) = handle(2);

        assert!(map.register("edge-1", old).is_none());
        let replaced = map.register("edge-1", new).unwrap();
        assert_eq!(replaced.id(), 1);

        assert!(!map.unregister("edge-1", 1));
        assert_eq!(map.lookup("edge-1").unwrap().id(), 2);
        assert!(map.unregister("edge-1", 2));
        assert!(map.lookup("edge-1").is_none());
    }

    #[test]
    fn for_each_open_skips_closed_writers() {
        let map = InMemoryConnections::new();
        let (live, _live_rx) = handle(1);
        let (dead, dead_rx) = handle(2);
        drop(dead_rx);
        map.register("edge-1", live);
        map.register("edge-2", dead);

        let mut seen = Vec::new();
        map.for_each_open(&mut |id, _| seen.push(id.to_string()));
        assert_eq!(seen, vec!["edge-1".to_string()]);
    }

    #[test]
    fn send_after_receiver_drop_reports_failure() {
        let (h, rx) = handle(7);
        assert!(h.send(Frame::Pong));
        drop(rx);
        assert!(!h.is_open());
        assert!(!h.send(Frame::Pong));
    }
}
