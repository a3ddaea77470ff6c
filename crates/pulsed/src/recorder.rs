//! State recorder: persists what the bus learns about peers.
//!
//! Advertised monitor states and aggregated liveness land in the node
//! record; per-heartbeat beating/stale edges land in `hb/<id>` status
//! documents of the peer. Once a peer is dropped, stale edges for it are
//! ignored until it beats again.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use pulsegrid_bus::{Bus, Message, MessageKind, Subscription};
use pulsegrid_state::{StateResult, StateStore, StatusDoc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct StateRecorder {
    store: StateStore,
    sub: Subscription,
    dropped: HashSet<String>,
}

impl StateRecorder {
    pub fn new(bus: &Bus, store: StateStore) -> Self {
        let mut sub = bus.subscribe("state-recorder");
        sub.add_filter(MessageKind::NodeMonitorUpdated)
            .add_filter(MessageKind::HbNodePing)
            .add_filter(MessageKind::HbPing)
            .add_filter(MessageKind::HbStale)
            .add_filter(MessageKind::PeerDropped);
        Self {
            store,
            sub,
            dropped: HashSet::new(),
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => break,
                msg = self.sub.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if let Err(e) = self.record(&msg) {
                warn!(kind = ?msg.kind(), error = %e, "failed to record bus message");
            }
        }
        debug!("state recorder stopped");
    }

    fn record(&mut self, msg: &Message) -> StateResult<()> {
        let now = unix_now();
        match msg {
            Message::NodeMonitorUpdated { node, state } => {
                self.store.update_node(node, |r| {
                    r.monitor_state = *state;
                    r.updated_at = now;
                })?;
            }
            // A dead peer may already have been dropped; do not bring it back.
            Message::HbNodePing { node, is_alive } => {
                if *is_alive {
                    self.dropped.remove(node);
                }
                if *is_alive || self.store.get_node(node)?.is_some() {
                    self.store.update_node(node, |r| {
                        r.alive = *is_alive;
                        r.updated_at = now;
                    })?;
                }
            }
            Message::HbPing { node, hb_id, at } | Message::HbStale { node, hb_id, at } => {
                let beating = matches!(msg, Message::HbPing { .. });
                if beating {
                    self.dropped.remove(node);
                } else if self.dropped.contains(node) {
                    debug!(%node, %hb_id, "stale edge of dropped peer ignored");
                    return Ok(());
                }
                let at_ms = at
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default();
                self.store.put_status(&StatusDoc {
                    node: node.clone(),
                    key: format!("hb/{hb_id}"),
                    value: serde_json::json!({ "beating": beating, "at_ms": at_ms }),
                    updated_at: now,
                })?;
            }
            // Edges recorded while the drop was in flight go too.
            Message::PeerDropped { node } => {
                self.dropped.insert(node.clone());
                self.store.drop_peer_node(node)?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
