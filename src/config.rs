//! BuddyMirror Configuration
//!
//! This module provides configuration structures for a buddy mirror node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::mirror::NodeType;
use crate::state::{NodeId, TargetId};

/// Main BuddyMirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuddyMirrorConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Coordinator (management node) configuration
    pub coordinator: CoordinatorConfig,

    /// Mirroring configuration
    #[serde(default)]
    pub mirroring: MirroringConfig,

    /// Target state timeouts
    #[serde(default)]
    pub states: StatesConfig,

    /// Resync job configuration
    #[serde(default)]
    pub resync: ResyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Address book of other nodes
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique numeric node identifier
    pub id: NodeId,

    /// Service type of this node
    #[serde(default = "default_node_type")]
    pub node_type: NodeType,

    /// Target served by this node
    pub target_id: TargetId,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Data directory for the resync marker
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Coordinator address
    pub address: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Delay before resending an unacknowledged resync decision
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Interval of the periodic resync check
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Mirroring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirroringConfig {
    /// Maximum in-flight mirrored requests per buddy group
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,

    /// Time the primary waits for its secondary
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Target state timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatesConfig {
    /// Silence after which a target is probably offline
    #[serde(default = "default_poffline_timeout_ms")]
    pub poffline_timeout_ms: u64,

    /// Silence after which a target is offline
    #[serde(default = "default_offline_timeout_ms")]
    pub offline_timeout_ms: u64,
}

/// Resync job configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResyncConfig {
    /// Command started as the resync job (optional)
    #[serde(default)]
    pub command: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Another node's address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub address: String,
}

// Default value functions
fn default_node_type() -> NodeType {
    NodeType::Meta
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/buddymirror")
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    10000
}

fn default_window_capacity() -> usize {
    12
}

fn default_forward_timeout_ms() -> u64 {
    10000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_poffline_timeout_ms() -> u64 {
    30000
}

fn default_offline_timeout_ms() -> u64 {
    180000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for MirroringConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            forward_timeout_ms: default_forward_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for StatesConfig {
    fn default() -> Self {
        Self {
            poffline_timeout_ms: default_poffline_timeout_ms(),
            offline_timeout_ms: default_offline_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl BuddyMirrorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: BuddyMirrorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id == 0 {
            return Err(crate::Error::Config("node.id must not be 0".into()));
        }

        if self.node.target_id == 0 {
            return Err(crate::Error::Config("node.target_id must not be 0".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.coordinator.address.is_empty() {
            return Err(crate::Error::Config("coordinator.address cannot be empty".into()));
        }

        if self.mirroring.window_capacity == 0 {
            return Err(crate::Error::Config("mirroring.window_capacity must be at least 1".into()));
        }

        if self.states.poffline_timeout_ms >= self.states.offline_timeout_ms {
            return Err(crate::Error::Config(
                "states.poffline_timeout_ms must be below states.offline_timeout_ms".into(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            )));
        }

        let mut ids: Vec<NodeId> = self.peers.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(crate::Error::Config("peers contain a duplicate node id".into()));
        }

        Ok(())
    }

    /// Address of a node from the peer list
    pub fn peer_address(&self, node_id: NodeId) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.id == node_id)
            .map(|p| p.address.as_str())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.coordinator.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.poll_interval_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.mirroring.forward_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.mirroring.connect_timeout_ms)
    }

    pub fn poffline_timeout(&self) -> Duration {
        Duration::from_millis(self.states.poffline_timeout_ms)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_millis(self.states.offline_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[node]
id = 10
node_type = "meta"
target_id = 1
bind_address = "0.0.0.0:7700"
data_dir = "/var/lib/buddymirror"

[coordinator]
address = "mgmt:7700"

[[peers]]
id = 20
address = "node-20:7700"
"#;

    #[test]
    fn test_parse_config() {
        let config = BuddyMirrorConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.node.id, 10);
        assert_eq!(config.node.node_type, NodeType::Meta);
        assert_eq!(config.mirroring.window_capacity, 12);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.offline_timeout(), Duration::from_secs(180));
        assert_eq!(config.peer_address(20), Some("node-20:7700"));
        assert_eq!(config.peer_address(30), None);
        assert!(config.resync.command.is_none());
    }

    #[test]
    fn test_validation() {
        let bad_timeouts = format!(
            "{}\n[states]\npoffline_timeout_ms = 9000\noffline_timeout_ms = 3000\n",
            SAMPLE
        );
        assert!(BuddyMirrorConfig::from_str(&bad_timeouts).is_err());

        let no_target = SAMPLE.replace("target_id = 1", "target_id = 0");
        assert!(BuddyMirrorConfig::from_str(&no_target).is_err());

        let duplicate_peer = format!("{}\n[[peers]]\nid = 20\naddress = \"other:7700\"\n", SAMPLE);
        assert!(BuddyMirrorConfig::from_str(&duplicate_peer).is_err());
    }
}
