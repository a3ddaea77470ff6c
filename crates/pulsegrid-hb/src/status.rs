//! Heartbeat status table types and the read-only snapshot cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use pulse_core::HbKind;
use serde::Serialize;
use tokio::sync::watch;

use crate::id::HeartbeatId;

/// Liveness of one peer under one heartbeat id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerStatus {
    pub beating: bool,
    /// Last positive beat, `None` until the first one.
    pub last_beat_at: Option<SystemTime>,
}

/// One registered heartbeat id and the peers it watches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatThreadStatus {
    pub id: HeartbeatId,
    pub kind: HbKind,
    /// Driver-reported state, informational only.
    pub state: String,
    pub created_at: SystemTime,
    pub peers: BTreeMap<String, PeerStatus>,
}

impl HeartbeatThreadStatus {
    pub(crate) fn new(id: HeartbeatId, kind: HbKind) -> Self {
        Self {
            id,
            kind,
            state: String::new(),
            created_at: SystemTime::now(),
            peers: BTreeMap::new(),
        }
    }
}

type Snapshot = Arc<Vec<HeartbeatThreadStatus>>;

/// Write side of the cache, owned by the control core.
pub(crate) struct StatusPublisher {
    tx: watch::Sender<Snapshot>,
}

impl StatusPublisher {
    pub(crate) fn publish(&self, snapshot: Vec<HeartbeatThreadStatus>) {
        self.tx.send_replace(Arc::new(snapshot));
    }
}

/// Eventually consistent copy of the status table, sorted by id and
/// refreshed on the control core's snapshot tick.
#[derive(Clone)]
pub struct StatusCache {
    rx: watch::Receiver<Snapshot>,
}

impl StatusCache {
    /// Latest snapshot. Cheap: shares the published allocation.
    pub fn snapshot(&self) -> Arc<Vec<HeartbeatThreadStatus>> {
        self.rx.borrow().clone()
    }

    #[cfg(test)]
    fn get(&self, id: &HeartbeatId) -> Option<HeartbeatThreadStatus> {
        self.rx.borrow().iter().find(|s| &s.id == id).cloned()
    }
}

pub(crate) fn status_cache() -> (StatusPublisher, StatusCache) {
    let (tx, rx) = watch::channel(Arc::new(Vec::new()));
    (StatusPublisher { tx }, StatusCache { rx })
}
