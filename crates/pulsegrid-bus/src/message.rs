//! Messages carried by the bus.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use pulse_core::MonitorState;
use serde::Serialize;

/// Routing labels attached to a published message.
pub type Labels = BTreeMap<String, String>;

/// Everything that travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Aggregated liveness edge of a peer node.
    HbNodePing { node: String, is_alive: bool },
    /// A peer started beating under one heartbeat id.
    HbPing {
        node: String,
        hb_id: String,
        at: SystemTime,
    },
    /// A peer went stale under one heartbeat id.
    HbStale {
        node: String,
        hb_id: String,
        at: SystemTime,
    },
    /// A peer advertised a new monitor state.
    NodeMonitorUpdated { node: String, state: MonitorState },
    /// The cluster configuration file was reloaded.
    ClusterConfigUpdated { maintenance_grace_period: Duration },
    /// All cached state of a peer was purged.
    PeerDropped { node: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    HbNodePing,
    HbPing,
    HbStale,
    NodeMonitorUpdated,
    ClusterConfigUpdated,
    PeerDropped,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::HbNodePing { .. } => MessageKind::HbNodePing,
            Message::HbPing { .. } => MessageKind::HbPing,
            Message::HbStale { .. } => MessageKind::HbStale,
            Message::NodeMonitorUpdated { .. } => MessageKind::NodeMonitorUpdated,
            Message::ClusterConfigUpdated { .. } => MessageKind::ClusterConfigUpdated,
            Message::PeerDropped { .. } => MessageKind::PeerDropped,
        }
    }

    /// Node the message is about, if it is node-scoped.
    pub fn node(&self) -> Option<&str> {
        match self {
            Message::HbNodePing { node, .. }
            | Message::HbPing { node, .. }
            | Message::HbStale { node, .. }
            | Message::NodeMonitorUpdated { node, .. }
            | Message::PeerDropped { node } => Some(node),
            Message::ClusterConfigUpdated { .. } => None,
        }
    }

    pub fn labels(&self) -> Labels {
        let mut labels = Labels::new();
        if let Some(node) = self.node() {
            labels.insert("node".to_string(), node.to_string());
        }
        labels
    }
}
