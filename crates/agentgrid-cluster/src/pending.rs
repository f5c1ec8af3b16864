//! Correlation table for request/response round trips over one
//! connection.
//!
//! Each outstanding id carries an explicit state. A plain request goes
//! `Pending → Completed`; two-phase requests go `Pending → Acked →
//! Completed`. Completion removes the entry, so late or duplicate
//! responses for an id are reported as unmatched instead of being
//! delivered twice.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// State of an outstanding correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Pending,
    Acked,
}

/// Why a pending entry finished without a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("rejected: {code} - {message}")]
    Rejected { code: String, message: String },

    #[error("connection closed")]
    Closed,

    #[error("timed out")]
    TimedOut,
}

type Outcome<T> = Result<T, PendingError>;

struct Entry<T> {
    state: PendingState,
    tx: oneshot::Sender<Outcome<T>>,
}

/// Outstanding correlation ids for one connection.
pub struct PendingTable<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`. Re-registering an id fails the previous waiter.
    pub fn register(&self, id: impl Into<String>) -> PendingWaiter<T> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let previous = self.entries.lock().expect("pending lock").insert(
            id.clone(),
            Entry {
                state: PendingState::Pending,
                tx,
            },
        );
        if let Some(prev) = previous {
            let _ = prev.tx.send(Err(PendingError::Closed));
        }
        PendingWaiter { id, rx }
    }

    /// Move `id` from `Pending` to `Acked`.
    ///
    /// Returns false for unknown ids and for ids already acked.
    pub fn ack(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().expect("pending lock");
        match entries.get_mut(id) {
            Some(entry) if entry.state == PendingState::Pending => {
                entry.state = PendingState::Acked;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, id: &str) -> Option<PendingState> {
        self.entries
            .lock()
            .expect("pending lock")
            .get(id)
            .map(|e| e.state)
    }

    /// Resolve `id` from either state. Returns false if nothing was waiting.
    pub fn complete(&self, id: &str, outcome: Outcome<T>) -> bool {
        let entry = self.entries.lock().expect("pending lock").remove(id);
        match entry {
            Some(entry) => entry.tx.send(outcome).is_ok(),
            None => {
                debug!(%id, "response for unknown correlation id");
                false
            }
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.entries.lock().expect("pending lock").remove(id).is_some()
    }

    /// Fail every outstanding entry. Returns how many were failed.
    pub fn fail_all(&self, error: PendingError) -> usize {
        let drained: Vec<_> = self
            .entries
            .lock()
            .expect("pending lock")
            .drain()
            .collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pending lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The waiting side of one registered id.
pub struct PendingWaiter<T> {
    id: String,
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> PendingWaiter<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the outcome, giving up after `timeout`.
    ///
    /// On timeout the entry is removed from `table`.
    pub async fn wait(self, table: &PendingTable<T>, timeout: Duration) -> Outcome<T> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PendingError::Closed),
            Err(_) => {
                table.remove(&self.id);
                Err(PendingError::TimedOut)
            }
        }
    }
}
