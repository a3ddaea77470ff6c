//! Shared types used across PulseGrid crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Administrative state a node advertises to its peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    #[default]
    Idle,
    /// Deliberate outage: peers wait out the maintenance grace period
    /// before dropping this node's state.
    Maintenance,
    Upgrade,
    Rejoin,
    Shutting,
}

impl MonitorState {
    pub fn is_maintenance(&self) -> bool {
        matches!(self, MonitorState::Maintenance)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Idle => "idle",
            MonitorState::Maintenance => "maintenance",
            MonitorState::Upgrade => "upgrade",
            MonitorState::Rejoin => "rejoin",
            MonitorState::Shutting => "shutting",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heartbeat transport family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HbKind {
    Unicast,
    Multicast,
    Disk,
    Relay,
}

impl HbKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HbKind::Unicast => "unicast",
            HbKind::Multicast => "multicast",
            HbKind::Disk => "disk",
            HbKind::Relay => "relay",
        }
    }
}

impl fmt::Display for HbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_state_serde_names() {
        let json = serde_json::to_string(&MonitorState::Maintenance).unwrap();
        assert_eq!(json, "\"maintenance\"");
        let state: MonitorState = serde_json::from_str("\"idle\"").unwrap();
        assert_eq!(state, MonitorState::Idle);
    }

    #[test]
    fn only_maintenance_extends_grace() {
        assert!(MonitorState::Maintenance.is_maintenance());
        assert!(!MonitorState::Upgrade.is_maintenance());
        assert!(!MonitorState::default().is_maintenance());
    }
}
