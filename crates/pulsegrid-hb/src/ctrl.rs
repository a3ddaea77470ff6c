//! Heartbeat control core.
//!
//! `Ctrl` is a single task owning every piece of heartbeat state: the status
//! table (one entry per registered heartbeat id), the peer watchers, and the
//! remote aggregator. Transports and watchers reach it only through its
//! command channel, so mutations are applied strictly in arrival order and
//! no lock guards the tables.
//!
//! Misuse (watching an unregistered id, duplicate watchers, unregistering
//! twice) is logged and ignored; the loop never stops on a bad command.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use pulse_core::HbKind;
use pulsegrid_bus::{Bus, Message};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::id::HeartbeatId;
use crate::status::{HeartbeatThreadStatus, PeerStatus, StatusCache, StatusPublisher, status_cache};
use crate::watcher::{self, EventKind, WatcherHandle};

const CMD_QUEUE_SIZE: usize = 1024;
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Commands accepted by the control core.
#[derive(Debug)]
pub enum Cmd {
    Register {
        id: HeartbeatId,
        kind: HbKind,
    },
    Unregister {
        id: HeartbeatId,
    },
    SetState {
        id: HeartbeatId,
        state: String,
    },
    AddWatcher {
        id: HeartbeatId,
        peer: String,
        token: CancellationToken,
        timeout: Duration,
    },
    DelWatcher {
        id: HeartbeatId,
        peer: String,
    },
    SetPeerSuccess {
        peer: String,
        id: HeartbeatId,
        success: bool,
    },
    /// Raised by a peer watcher on a beating/stale transition.
    Event {
        kind: EventKind,
        peer: String,
        id: HeartbeatId,
        /// Generation of the raising watcher; events of a replaced watcher
        /// are dropped.
        generation: u64,
        at: SystemTime,
    },
    GetEventStats {
        reply: oneshot::Sender<HashMap<String, u64>>,
    },
    GetPeerStatus {
        id: HeartbeatId,
        reply: oneshot::Sender<HashMap<String, PeerStatus>>,
    },
}

/// The control core task. Build with [`Ctrl::new`], then `run` it.
pub struct Ctrl {
    cmd_rx: mpsc::Receiver<Cmd>,
    /// Handed to watchers so their events share the command ordering.
    cmd_tx: mpsc::Sender<Cmd>,
    bus: Bus,
    publisher: StatusPublisher,
    cache: StatusCache,
    snapshot_interval: Duration,
    threads: HashMap<HeartbeatId, HeartbeatThreadStatus>,
    watchers: HashMap<(HeartbeatId, String), WatcherHandle>,
    remotes: Aggregator,
    event_stats: HashMap<String, u64>,
    next_generation: u64,
}

impl Ctrl {
    /// Create the control core and the handle used to command it.
    pub fn new(bus: Bus) -> (Self, CtrlHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE_SIZE);
        let (publisher, cache) = status_cache();
        let ctrl = Self {
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            bus,
            publisher,
            cache,
            snapshot_interval: SNAPSHOT_INTERVAL,
            threads: HashMap::new(),
            watchers: HashMap::new(),
            remotes: Aggregator::new(),
            event_stats: HashMap::new(),
            next_generation: 0,
        };
        (ctrl, CtrlHandle { tx: cmd_tx })
    }

    /// Set the status snapshot period.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Read side of the periodic status snapshot.
    pub fn status_cache(&self) -> StatusCache {
        self.cache.clone()
    }

    /// Process commands until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.snapshot_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("hb ctrl started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(cmd) = self.cmd_rx.recv() => self.handle(cmd),
                _ = ticker.tick() => self.publish_snapshot(),
            }
        }

        for ((id, peer), handle) in self.watchers.drain() {
            debug!(hb_id = %id, %peer, "cancelling watcher on shutdown");
            handle.cancel();
        }
        info!("hb ctrl stopped");
    }

    fn handle(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Register { id, kind } => self.register(id, kind),
            Cmd::Unregister { id } => self.unregister(&id),
            Cmd::SetState { id, state } => self.set_state(&id, state),
            Cmd::AddWatcher {
                id,
                peer,
                token,
                timeout,
            } => self.add_watcher(id, peer, &token, timeout),
            Cmd::DelWatcher { id, peer } => self.del_watcher(id, peer),
            Cmd::SetPeerSuccess { peer, id, success } => self.set_peer_success(id, peer, success),
            Cmd::Event {
                kind,
                peer,
                id,
                generation,
                at,
            } => self.on_event(kind, &id, &peer, generation, at),
            Cmd::GetEventStats { reply } => {
                if reply.send(self.event_stats.clone()).is_err() {
                    debug!("event stats requester gone");
                }
            }
            Cmd::GetPeerStatus { id, reply } => {
                let peers = self
                    .threads
                    .get(&id)
                    .map(|t| t.peers.clone().into_iter().collect())
                    .unwrap_or_default();
                if reply.send(peers).is_err() {
                    debug!(hb_id = %id, "peer status requester gone");
                }
            }
        }
    }

    fn register(&mut self, id: HeartbeatId, kind: HbKind) {
        if self.threads.contains_key(&id) {
            error!(hb_id = %id, "register: already registered");
            return;
        }
        info!(hb_id = %id, %kind, "heartbeat registered");
        self.threads
            .insert(id.clone(), HeartbeatThreadStatus::new(id, kind));
    }

    fn unregister(&mut self, id: &HeartbeatId) {
        let Some(thread) = self.threads.remove(id) else {
            error!(hb_id = %id, "unregister: not registered");
            return;
        };

        // Beating peers lose this id's vote as if they went stale.
        for (peer, status) in &thread.peers {
            if status.beating {
                self.apply_stale(id, peer, SystemTime::now());
            }
        }

        let keys: Vec<_> = self
            .watchers
            .keys()
            .filter(|(wid, _)| wid == id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(handle) = self.watchers.remove(&key) {
                handle.cancel();
                self.remotes.del_watcher(&key.0, &key.1);
            }
        }
        info!(hb_id = %id, "heartbeat unregistered");
    }

    fn set_state(&mut self, id: &HeartbeatId, state: String) {
        match self.threads.get_mut(id) {
            Some(thread) => {
                debug!(hb_id = %id, %state, "heartbeat state");
                thread.state = state;
            }
            None => error!(hb_id = %id, %state, "set state: not registered"),
        }
    }

    fn add_watcher(
        &mut self,
        id: HeartbeatId,
        peer: String,
        token: &CancellationToken,
        timeout: Duration,
    ) {
        let Some(thread) = self.threads.get_mut(&id) else {
            error!(hb_id = %id, %peer, "add watcher: register not found");
            return;
        };
        let key = (id, peer);
        if self.watchers.contains_key(&key) {
            error!(hb_id = %key.0, peer = %key.1, "add watcher: duplicate watcher");
            return;
        }

        thread.peers.entry(key.1.clone()).or_default();
        self.remotes.add_watcher(&key.0, &key.1);
        self.next_generation += 1;
        let handle = watcher::spawn(
            key.0.clone(),
            key.1.clone(),
            self.next_generation,
            timeout,
            token.child_token(),
            self.cmd_tx.clone(),
        );
        debug!(hb_id = %key.0, peer = %key.1, ?timeout, "watcher added");
        self.watchers.insert(key, handle);
    }

    fn del_watcher(&mut self, id: HeartbeatId, peer: String) {
        let key = (id, peer);
        let Some(handle) = self.watchers.remove(&key) else {
            error!(hb_id = %key.0, peer = %key.1, "del watcher: no such watcher");
            return;
        };
        handle.cancel();
        let (id, peer) = key;

        let was_beating = self
            .threads
            .get(&id)
            .and_then(|t| t.peers.get(&peer))
            .is_some_and(|p| p.beating);
        if was_beating {
            self.apply_stale(&id, &peer, SystemTime::now());
        }
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.peers.remove(&peer);
        }
        self.remotes.del_watcher(&id, &peer);
        debug!(hb_id = %id, %peer, "watcher deleted");
    }

    fn set_peer_success(&mut self, id: HeartbeatId, peer: String, success: bool) {
        let key = (id, peer);
        let Some(handle) = self.watchers.get(&key) else {
            debug!(hb_id = %key.0, peer = %key.1, success, "set peer success: no watcher");
            return;
        };
        if success {
            if let Some(status) = self
                .threads
                .get_mut(&key.0)
                .and_then(|t| t.peers.get_mut(&key.1))
            {
                status.last_beat_at = Some(SystemTime::now());
            }
        }
        handle.beat(success);
    }

    fn on_event(
        &mut self,
        kind: EventKind,
        id: &HeartbeatId,
        peer: &str,
        generation: u64,
        at: SystemTime,
    ) {
        let live = self
            .watchers
            .get(&(id.clone(), peer.to_string()))
            .map(|h| h.generation);
        if live != Some(generation) {
            debug!(hb_id = %id, %peer, event = %kind, generation, ?live, "event from replaced watcher, ignored");
            return;
        }
        *self.event_stats.entry(kind.as_str().to_string()).or_default() += 1;

        // The status flag decides whether this is a real transition.
        let Some(status) = self
            .threads
            .get(id)
            .and_then(|t| t.peers.get(peer))
        else {
            debug!(hb_id = %id, %peer, event = %kind, "event for unwatched peer, ignored");
            return;
        };
        match (kind, status.beating) {
            (EventKind::Beating, false) => self.apply_beating(id, peer, at),
            (EventKind::Stale, true) => self.apply_stale(id, peer, at),
            _ => debug!(hb_id = %id, %peer, event = %kind, "event without transition, ignored"),
        }
    }

    fn apply_beating(&mut self, id: &HeartbeatId, peer: &str, at: SystemTime) {
        self.set_beating(id, peer, true, Some(at));
        self.bus.publish(Message::HbPing {
            node: peer.to_string(),
            hb_id: id.to_string(),
            at,
        });
        if let Some(is_alive) = self.remotes.beating(id, peer) {
            self.publish_node_ping(peer, is_alive);
        }
    }

    fn apply_stale(&mut self, id: &HeartbeatId, peer: &str, at: SystemTime) {
        self.set_beating(id, peer, false, None);
        self.bus.publish(Message::HbStale {
            node: peer.to_string(),
            hb_id: id.to_string(),
            at,
        });
        if let Some(is_alive) = self.remotes.stale(id, peer) {
            self.publish_node_ping(peer, is_alive);
        }
    }

    fn set_beating(&mut self, id: &HeartbeatId, peer: &str, beating: bool, at: Option<SystemTime>) {
        if let Some(status) = self
            .threads
            .get_mut(id)
            .and_then(|t| t.peers.get_mut(peer))
        {
            status.beating = beating;
            if at.is_some() {
                status.last_beat_at = at;
            }
        }
    }

    fn publish_node_ping(&self, peer: &str, is_alive: bool) {
        if is_alive {
            info!(%peer, "peer node alive");
        } else {
            warn!(%peer, "peer node stale on all heartbeats");
        }
        self.bus.publish(Message::HbNodePing {
            node: peer.to_string(),
            is_alive,
        });
    }

    fn publish_snapshot(&self) {
        let mut snapshot: Vec<HeartbeatThreadStatus> = self.threads.values().cloned().collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        self.publisher.publish(snapshot);
    }
}

/// Cloneable handle to the control core.
///
/// Commands are fire-and-forget: once the core is gone they are dropped
/// with a debug log, and queries answer with empty maps.
#[derive(Clone)]
pub struct CtrlHandle {
    tx: mpsc::Sender<Cmd>,
}

impl CtrlHandle {
    pub async fn send(&self, cmd: Cmd) {
        if let Err(e) = self.tx.send(cmd).await {
            debug!(cmd = ?e.0, "hb ctrl gone, command dropped");
        }
    }

    pub async fn register(&self, id: HeartbeatId, kind: HbKind) {
        self.send(Cmd::Register { id, kind }).await;
    }

    pub async fn unregister(&self, id: HeartbeatId) {
        self.send(Cmd::Unregister { id }).await;
    }

    pub async fn set_state(&self, id: HeartbeatId, state: &str) {
        self.send(Cmd::SetState {
            id,
            state: state.to_string(),
        })
        .await;
    }

    /// Watch `peer` under `id`. The watcher also stops if `token` is cancelled.
    pub async fn add_watcher(
        &self,
        id: HeartbeatId,
        peer: &str,
        token: &CancellationToken,
        timeout: Duration,
    ) {
        self.send(Cmd::AddWatcher {
            id,
            peer: peer.to_string(),
            token: token.clone(),
            timeout,
        })
        .await;
    }

    pub async fn del_watcher(&self, id: HeartbeatId, peer: &str) {
        self.send(Cmd::DelWatcher {
            id,
            peer: peer.to_string(),
        })
        .await;
    }

    pub async fn set_peer_success(&self, peer: &str, id: HeartbeatId, success: bool) {
        self.send(Cmd::SetPeerSuccess {
            peer: peer.to_string(),
            id,
            success,
        })
        .await;
    }

    /// Event name → count since start.
    pub async fn event_stats(&self) -> HashMap<String, u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::GetEventStats { reply }).await;
        rx.await.unwrap_or_default()
    }

    /// Copy of the per-peer status of `id`; empty if `id` is unknown.
    pub async fn peer_status(&self, id: &HeartbeatId) -> HashMap<String, PeerStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::GetPeerStatus {
            id: id.clone(),
            reply,
        })
        .await;
        rx.await.unwrap_or_default()
    }
}
