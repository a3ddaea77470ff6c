//! Remote aggregator: one alive/dead verdict per peer node.
//!
//! Every `.rx` heartbeat id beating a peer is one vote for "alive". The
//! peer is alive while at least one rx id beats it and dead once none does;
//! callers learn about the verdict only on its 0↔1 edges. `.tx` ids are
//! counted for diagnostics but never vote: they reflect local send success,
//! not remote liveness.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, error};

use crate::id::{Direction, HeartbeatId};

/// Per-peer watcher and beating counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteBeating {
    pub rx_watchers: usize,
    pub tx_watchers: usize,
    pub rx_beating: usize,
    pub tx_beating: usize,
}

impl RemoteBeating {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Default)]
pub struct Aggregator {
    remotes: HashMap<String, RemoteBeating>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn get(&self, peer: &str) -> Option<&RemoteBeating> {
        self.remotes.get(peer)
    }

    #[cfg(test)]
    fn is_alive(&self, peer: &str) -> bool {
        self.remotes.get(peer).is_some_and(|r| r.rx_beating > 0)
    }

    pub fn add_watcher(&mut self, id: &HeartbeatId, peer: &str) {
        let remote = self.remotes.entry(peer.to_string()).or_default();
        match id.direction() {
            Some(Direction::Rx) => remote.rx_watchers += 1,
            Some(Direction::Tx) => remote.tx_watchers += 1,
            None => debug!(hb_id = %id, %peer, "watcher without direction, not counted"),
        }
    }

    /// Drop one watcher. The peer's record goes away with its last counter.
    pub fn del_watcher(&mut self, id: &HeartbeatId, peer: &str) {
        let Some(remote) = self.remotes.get_mut(peer) else {
            return;
        };
        match id.direction() {
            Some(Direction::Rx) => decrement(&mut remote.rx_watchers, "rx_watchers", id, peer),
            Some(Direction::Tx) => decrement(&mut remote.tx_watchers, "tx_watchers", id, peer),
            None => {}
        }
        if remote.is_empty() {
            self.remotes.remove(peer);
        }
    }

    /// Record that `peer` started beating under `id`. Returns `Some(true)`
    /// when this made the peer alive.
    pub fn beating(&mut self, id: &HeartbeatId, peer: &str) -> Option<bool> {
        let remote = self.remotes.entry(peer.to_string()).or_default();
        match id.direction() {
            Some(Direction::Rx) => {
                remote.rx_beating += 1;
                (remote.rx_beating == 1).then_some(true)
            }
            Some(Direction::Tx) => {
                remote.tx_beating += 1;
                None
            }
            None => None,
        }
    }

    /// Record that `peer` went stale under `id`. Returns `Some(false)` when
    /// this was the last rx id beating the peer.
    pub fn stale(&mut self, id: &HeartbeatId, peer: &str) -> Option<bool> {
        let Some(remote) = self.remotes.get_mut(peer) else {
            error!(hb_id = %id, %peer, "stale for untracked peer, ignored");
            return None;
        };
        match id.direction() {
            Some(Direction::Rx) => {
                if remote.rx_beating == 0 {
                    error!(hb_id = %id, %peer, "rx beating count would go negative, clamped at zero");
                    return None;
                }
                remote.rx_beating -= 1;
                (remote.rx_beating == 0).then_some(false)
            }
            Some(Direction::Tx) => {
                decrement(&mut remote.tx_beating, "tx_beating", id, peer);
                None
            }
            None => None,
        }
    }
}

/// Decrement a counter, clamping at zero. Going below zero means events
/// arrived out of order; that is logged rather than treated as fatal.
fn decrement(counter: &mut usize, name: &str, id: &HeartbeatId, peer: &str) {
    match counter.checked_sub(1) {
        Some(v) => *counter = v,
        None => error!(hb_id = %id, %peer, counter = name, "counter would go negative, clamped at zero"),
    }
}
