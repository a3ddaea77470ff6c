//! cluster.toml configuration parser.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{HbKind, MonitorState};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);
/// Added to twice the interval when a heartbeat has no explicit timeout.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster: ClusterSection,
    pub node: NodeSection,
    #[serde(default)]
    pub hb: Vec<HbConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    pub name: String,
    pub nodes: Vec<String>,
    pub maintenance_grace_period: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub name: String,
    #[serde(default)]
    pub monitor_state: MonitorState,
}

/// One `[[hb]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HbConfig {
    /// Transport name, e.g. `hb#1`. The tx/rx ids derive from it.
    pub name: String,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    #[serde(flatten)]
    pub driver: HbDriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HbDriverConfig {
    Unicast {
        port: u16,
        /// Peer node name → host. Peers not listed are dialed by name.
        #[serde(default)]
        addrs: HashMap<String, String>,
    },
    Multicast {
        addr: String,
        port: u16,
        intf: Option<String>,
    },
    Disk {
        dev: PathBuf,
    },
    Relay {
        relay: String,
    },
}

impl HbDriverConfig {
    pub fn kind(&self) -> HbKind {
        match self {
            HbDriverConfig::Unicast { .. } => HbKind::Unicast,
            HbDriverConfig::Multicast { .. } => HbKind::Multicast,
            HbDriverConfig::Disk { .. } => HbKind::Disk,
            HbDriverConfig::Relay { .. } => HbKind::Relay,
        }
    }
}

impl HbConfig {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        match &self.interval {
            Some(s) => parse_field(&format!("{}.interval", self.name), s),
            None => Ok(DEFAULT_INTERVAL),
        }
    }

    /// Peer timeout, defaulting to `2 × interval + 5s`.
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        match &self.timeout {
            Some(s) => parse_field(&format!("{}.timeout", self.name), s),
            None => Ok(self.interval()? * 2 + TIMEOUT_MARGIN),
        }
    }

    pub fn tx_id(&self) -> String {
        format!("{}.tx", self.name)
    }

    pub fn rx_id(&self) -> String {
        format!("{}.rx", self.name)
    }
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cluster.nodes.contains(&self.node.name) {
            return Err(ConfigError::Invalid(format!(
                "local node {} is not listed in cluster.nodes",
                self.node.name
            )));
        }

        let mut seen = HashSet::new();
        for hb in &self.hb {
            if !seen.insert(hb.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate heartbeat name {}",
                    hb.name
                )));
            }
            let interval = hb.interval()?;
            if interval.is_zero() {
                return Err(ConfigError::Invalid(format!("{}: interval must be > 0", hb.name)));
            }
            if hb.timeout()? <= interval {
                return Err(ConfigError::Invalid(format!(
                    "{}: timeout must exceed interval",
                    hb.name
                )));
            }
        }

        self.maintenance_grace_period()?;
        Ok(())
    }

    pub fn maintenance_grace_period(&self) -> Result<Duration, ConfigError> {
        match &self.cluster.maintenance_grace_period {
            Some(s) => parse_field("cluster.maintenance_grace_period", s),
            None => Ok(DEFAULT_GRACE_PERIOD),
        }
    }

    /// All cluster nodes except the local one, in configuration order.
    pub fn peers(&self) -> Vec<String> {
        self.cluster
            .nodes
            .iter()
            .filter(|n| **n != self.node.name)
            .cloned()
            .collect()
    }
}

impl std::str::FromStr for ClusterConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: ClusterConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_field(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[cluster]
name = "prod"
nodes = ["n1", "n2", "n3"]
maintenance_grace_period = "90s"

[node]
name = "n1"

[[hb]]
name = "hb#1"
type = "unicast"
port = 10011
interval = "2s"
addrs = { n2 = "10.0.0.2" }

[[hb]]
name = "hb#2"
type = "multicast"
addr = "224.3.29.71"
port = 10012
timeout = "20s"

[[hb]]
name = "hb#3"
type = "disk"
dev = "/var/lib/pulsegrid/hb.slots"

[[hb]]
name = "hb#4"
type = "relay"
relay = "relay.example:1215"
"#;

    #[test]
    fn parse_full_config() {
        let config: ClusterConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.cluster.name, "prod");
        assert_eq!(config.node.monitor_state, MonitorState::Idle);
        assert_eq!(config.hb.len(), 4);
        assert_eq!(config.hb[0].driver.kind(), HbKind::Unicast);
        assert_eq!(config.hb[3].driver.kind(), HbKind::Relay);
        assert_eq!(
            config.maintenance_grace_period().unwrap(),
            Duration::from_secs(90)
        );
        match &config.hb[0].driver {
            HbDriverConfig::Unicast { port, addrs } => {
                assert_eq!(*port, 10011);
                assert_eq!(addrs.get("n2").unwrap(), "10.0.0.2");
            }
            other => panic!("unexpected driver {other:?}"),
        }
    }

    #[test]
    fn timeout_defaults_to_twice_interval_plus_margin() {
        let config: ClusterConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.hb[0].timeout().unwrap(), Duration::from_secs(9));
        assert_eq!(config.hb[1].timeout().unwrap(), Duration::from_secs(20));
        assert_eq!(config.hb[2].interval().unwrap(), Duration::from_secs(5));
        assert_eq!(config.hb[2].timeout().unwrap(), Duration::from_secs(15));
    }

    #[test]
    fn ids_and_peers() {
        let config: ClusterConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.hb[0].rx_id(), "hb#1.rx");
        assert_eq!(config.hb[0].tx_id(), "hb#1.tx");
        assert_eq!(config.peers(), vec!["n2".to_string(), "n3".to_string()]);
    }

    #[test]
    fn local_node_must_be_member() {
        let toml_str = r#"
[cluster]
name = "c"
nodes = ["a", "b"]

[node]
name = "z"
"#;
        let err = toml_str.parse::<ClusterConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn duplicate_hb_names_rejected() {
        let toml_str = r#"
[cluster]
name = "c"
nodes = ["a", "b"]

[node]
name = "a"

[[hb]]
name = "hb#1"
type = "disk"
dev = "/tmp/a"

[[hb]]
name = "hb#1"
type = "disk"
dev = "/tmp/b"
"#;
        assert!(toml_str.parse::<ClusterConfig>().is_err());
    }

    #[test]
    fn timeout_not_above_interval_rejected() {
        let toml_str = r#"
[cluster]
name = "c"
nodes = ["a", "b"]

[node]
name = "a"

[[hb]]
name = "hb#1"
type = "relay"
relay = "r:1"
interval = "10s"
timeout = "10s"
"#;
        assert!(toml_str.parse::<ClusterConfig>().is_err());
    }

    #[test]
    fn bad_grace_period_rejected() {
        let toml_str = r#"
[cluster]
name = "c"
nodes = ["a"]
maintenance_grace_period = "soon"

[node]
name = "a"
"#;
        let err = toml_str.parse::<ClusterConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Duration { .. }));
    }

    #[test]
    fn from_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ClusterConfig::from_file(&path).unwrap();
        assert_eq!(config.node.name, "n1");

        let missing = ClusterConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("3m"), Some(Duration::from_secs(180)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("invalid"), None);
    }
}
