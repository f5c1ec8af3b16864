//! agentd.toml configuration parser.
//!
//! Every field is optional; command-line flags override file values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentdConfig {
    pub machine_id: Option<String>,
    pub port: Option<u16>,
    /// Hub only: externally reachable base URL, e.g. `http://203.0.113.4:9100`.
    pub public_url: Option<String>,
    pub secret: Option<String>,
    pub capabilities: Vec<String>,
    /// Edge only: initial candidate hub addresses.
    pub hubs: Vec<String>,
    /// Hub only: peer hub URLs to announce this hub to at startup.
    pub join: Vec<String>,
    pub timing: TimingConfig,
}

/// Intervals and timeouts for the cluster protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub peer_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub max_missed_pongs: u32,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub join_grace_secs: u64,
    pub handshake_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub hub_heartbeat_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            peer_timeout_secs: 8,
            ping_interval_secs: 30,
            max_missed_pongs: 3,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            join_grace_secs: 10,
            handshake_timeout_secs: 10,
            connect_timeout_secs: 10,
            hub_heartbeat_secs: 60,
        }
    }
}

impl TimingConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn join_grace(&self) -> Duration {
        Duration::from_secs(self.join_grace_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn hub_heartbeat(&self) -> Duration {
        Duration::from_secs(self.hub_heartbeat_secs)
    }

    /// Every interval, timeout, and the missed-pong limit must be non-zero.
    pub fn validate(&self) -> anyhow::Result<()> {
        let fields = [
            ("peer_timeout_secs", self.peer_timeout_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("max_missed_pongs", u64::from(self.max_missed_pongs)),
            ("reconnect_initial_ms", self.reconnect_initial_ms),
            ("reconnect_max_ms", self.reconnect_max_ms),
            ("join_grace_secs", self.join_grace_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("hub_heartbeat_secs", self.hub_heartbeat_secs),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| *value == 0) {
            anyhow::bail!("timing.{name} must be greater than zero");
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            anyhow::bail!("timing.reconnect_max_ms must not be below reconnect_initial_ms");
        }
        Ok(())
    }
}

impl AgentdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentdConfig = toml::from_str(&content)?;
        config.timing.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Configured port, or the default 9100.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(9100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config: AgentdConfig = toml::from_str("machine_id = \"hub-1\"\n").unwrap();
        assert_eq!(config.machine_id.as_deref(), Some("hub-1"));
        assert_eq!(config.port_or_default(), 9100);
        assert_eq!(config.timing, TimingConfig::default());
    }

    #[test]
    fn test_parse_timing_overrides() {
        let toml_str = r#"
machine_id = "edge-1"
secret = "s3cret"
hubs = ["ws://10.0.0.1:9100/cluster/ws", "10.0.0.2:9100"]
capabilities = ["generic"]

[timing]
ping_interval_secs = 5
reconnect_max_ms = 4000
"#;
        let config: AgentdConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.hubs.len(), 2);
        assert_eq!(config.timing.ping_interval(), Duration::from_secs(5));
        assert_eq!(config.timing.reconnect_max(), Duration::from_millis(4000));
        assert_eq!(config.timing.max_missed_pongs, 3);
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentd.toml");
        let config = AgentdConfig {
            machine_id: Some("hub-1".into()),
            public_url: Some("http://203.0.113.4:9100".into()),
            ..Default::default()
        };
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = AgentdConfig::from_file(&path).unwrap();
        assert_eq!(loaded.public_url.as_deref(), Some("http://203.0.113.4:9100"));
    }

    #[test]
    fn test_from_file_rejects_zero_timing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentd.toml");
        std::fs::write(&path, "machine_id = \"edge-1\"\n\n[timing]\nping_interval_secs = 0\n").unwrap();

        let err = AgentdConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("ping_interval_secs"));
    }

    #[test]
    fn test_validate_timing() {
        assert!(TimingConfig::default().validate().is_ok());

        let spin = TimingConfig {
            reconnect_initial_ms: 0,
            ..Default::default()
        };
        assert!(spin.validate().is_err());

        let inverted = TimingConfig {
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 1_000,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
