//! Reconnect policy for the edge client: a rotating list of candidate
//! hub addresses plus an exponential backoff delay.
//!
//! Kept free of I/O so failover order and delay growth can be checked
//! directly.

use std::time::Duration;

use crate::acceptor::CLUSTER_WS_PATH;

/// Candidate hubs and the delay before the next attempt.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    addresses: Vec<String>,
    index: usize,
    delay: Duration,
    initial: Duration,
    max: Duration,
}

impl ReconnectPolicy {
    pub fn new(addresses: Vec<String>, initial: Duration, max: Duration) -> Self {
        Self {
            addresses,
            index: 0,
            delay: initial,
            initial,
            max,
        }
    }

    /// Address the next attempt should use.
    pub fn current(&self) -> Option<&str> {
        self.addresses.get(self.index).map(String::as_str)
    }

    /// Rotate to the next candidate (wrapping) and return it.
    pub fn advance(&mut self) -> Option<&str> {
        if !self.addresses.is_empty() {
            self.index = (self.index + 1) % self.addresses.len();
        }
        self.current()
    }

    /// Delay to wait before the next attempt.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Double the delay, up to the ceiling.
    pub fn record_failure(&mut self) {
        self.delay = (self.delay * 2).min(self.max);
    }

    /// Back to the initial delay after a successful join.
    pub fn reset(&mut self) {
        self.delay = self.initial;
    }

    /// Replace the candidate list with hubs learned from a `welcome`.
    ///
    /// An empty list keeps the current candidates.
    pub fn learn(&mut self, addresses: Vec<String>) {
        if addresses.is_empty() {
            return;
        }
        self.addresses = addresses;
        self.index = 0;
    }

    /// Point at `address` if it is a candidate, so the next `advance`
    /// moves past the hub currently in use.
    pub fn select(&mut self, address: &str) -> bool {
        match self.addresses.iter().position(|a| a == address) {
            Some(index) => {
                self.index = index;
                true
            }
            None => false,
        }
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }
}

/// Turn a hub address into the WebSocket URL to dial.
///
/// Accepts `ws://`/`wss://` URLs, `http://`/`https://` bridge URLs, and
/// bare `host:port`. Appends [`CLUSTER_WS_PATH`] when no path is given.
pub fn ws_url(address: &str) -> String {
    let (scheme, rest) = if let Some(rest) = address.strip_prefix("wss://") {
        ("wss", rest)
    } else if let Some(rest) = address.strip_prefix("ws://") {
        ("ws", rest)
    } else if let Some(rest) = address.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = address.strip_prefix("http://") {
        ("ws", rest)
    } else {
        ("ws", address)
    };

    let rest = rest.trim_end_matches('/');
    if rest.contains('/') {
        format!("{scheme}://{rest}")
    } else {
        format!("{scheme}://{rest}{CLUSTER_WS_PATH}")
    }
}
