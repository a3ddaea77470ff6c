//! Domain types for the PulseGrid state store.

use pulse_core::MonitorState;
use serde::{Deserialize, Serialize};

/// Name of a node in the cluster.
pub type NodeName = String;

/// What this node knows about a cluster node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub name: NodeName,
    /// Monitor state last advertised by the node.
    pub monitor_state: MonitorState,
    /// Aggregated heartbeat liveness.
    pub alive: bool,
    /// Unix timestamp (seconds) of the last update.
    pub updated_at: u64,
}

/// Opaque status document cached for a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusDoc {
    pub node: NodeName,
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: u64,
}

impl NodeRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            monitor_state: MonitorState::default(),
            alive: false,
            updated_at: 0,
        }
    }
}

impl StatusDoc {
    /// Build the composite key for the node status table.
    pub fn table_key(&self) -> String {
        status_key(&self.node, &self.key)
    }
}

pub(crate) fn status_key(node: &str, key: &str) -> String {
    format!("{node}/{key}")
}
