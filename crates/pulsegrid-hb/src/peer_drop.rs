//! Peer-drop supervisor: purges the cluster state of peers that stay dead.
//!
//! Listens for aggregated liveness (`HbNodePing`), peer monitor states and
//! configuration reloads. A peer reported dead gets a pending drop whose
//! timer is the maintenance grace period if the peer last advertised the
//! maintenance monitor state, and zero otherwise. A peer reported alive
//! again cancels its pending drop. When a timer expires the supervisor asks
//! the [`PeerDropper`] to purge the peer; failures are logged and not
//! retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pulse_core::MonitorState;
use pulsegrid_bus::{Bus, Message, MessageKind, Subscription};
use pulsegrid_state::StateStore;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Removes all cached cluster state of a node.
pub trait PeerDropper: Send + Sync + 'static {
    fn drop_peer(&self, node: &str) -> anyhow::Result<()>;
}

impl PeerDropper for StateStore {
    fn drop_peer(&self, node: &str) -> anyhow::Result<()> {
        self.drop_peer_node(node)?;
        Ok(())
    }
}

struct PendingDrop {
    token: CancellationToken,
    generation: u64,
    deadline: Instant,
}

pub struct PeerDropSupervisor {
    dropper: Arc<dyn PeerDropper>,
    bus: Bus,
    sub: Subscription,
    grace_period: Duration,
    monitor: HashMap<String, MonitorState>,
    pending: HashMap<String, PendingDrop>,
    expired_tx: mpsc::UnboundedSender<(String, u64)>,
    expired_rx: mpsc::UnboundedReceiver<(String, u64)>,
    next_generation: u64,
}

impl PeerDropSupervisor {
    /// Subscribe to the bus right away so nothing published before `run`
    /// is missed.
    pub fn new(bus: Bus, dropper: Arc<dyn PeerDropper>, grace_period: Duration) -> Self {
        let mut sub = bus.subscribe("peer-drop");
        sub.add_filter(MessageKind::HbNodePing)
            .add_filter(MessageKind::NodeMonitorUpdated)
            .add_filter(MessageKind::ClusterConfigUpdated);
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Self {
            dropper,
            bus,
            sub,
            grace_period,
            monitor: HashMap::new(),
            pending: HashMap::new(),
            expired_tx,
            expired_rx,
            next_generation: 0,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!(grace_period = ?self.grace_period, "peer drop supervisor started");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                msg = self.sub.recv() => match msg {
                    Some(msg) => self.on_message(msg),
                    None => break,
                },
                Some((node, generation)) = self.expired_rx.recv() => self.on_expired(&node, generation),
            }
        }
        for (_, pending) in self.pending.drain() {
            pending.token.cancel();
        }
        info!("peer drop supervisor stopped");
    }

    fn on_message(&mut self, msg: Message) {
        match msg {
            Message::HbNodePing {
                node,
                is_alive: false,
            } => self.schedule(node),
            Message::HbNodePing {
                node,
                is_alive: true,
            } => {
                if let Some(pending) = self.pending.remove(&node) {
                    pending.token.cancel();
                    info!(%node, "peer alive again, drop cancelled");
                }
            }
            Message::NodeMonitorUpdated { node, state } => {
                debug!(%node, %state, "peer monitor state");
                self.monitor.insert(node, state);
            }
            Message::ClusterConfigUpdated {
                maintenance_grace_period,
            } => self.set_grace_period(maintenance_grace_period),
            _ => {}
        }
    }

    fn delay_for(&self, node: &str) -> Duration {
        match self.monitor.get(node) {
            Some(state) if state.is_maintenance() => self.grace_period,
            _ => Duration::ZERO,
        }
    }

    fn schedule(&mut self, node: String) {
        if self.pending.contains_key(&node) {
            debug!(%node, "drop already pending");
            return;
        }
        let delay = self.delay_for(&node);
        info!(%node, ?delay, "peer stale, drop scheduled");
        self.arm(node, delay);
    }

    /// Start (or restart) the drop timer of `node`.
    fn arm(&mut self, node: String, delay: Duration) {
        if let Some(old) = self.pending.remove(&node) {
            old.token.cancel();
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let token = CancellationToken::new();
        let deadline = Instant::now() + delay;

        let expired_tx = self.expired_tx.clone();
        let timer_token = token.clone();
        let timer_node = node.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer_token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = expired_tx.send((timer_node, generation));
                }
            }
        });

        self.pending.insert(
            node,
            PendingDrop {
                token,
                generation,
                deadline,
            },
        );
    }

    /// Restart every pending drop from now with the new grace period.
    fn set_grace_period(&mut self, grace_period: Duration) {
        if grace_period == self.grace_period {
            return;
        }
        info!(old = ?self.grace_period, new = ?grace_period, "maintenance grace period changed");
        self.grace_period = grace_period;

        let nodes: Vec<String> = self.pending.keys().cloned().collect();
        for node in nodes {
            let delay = self.delay_for(&node);
            if let Some(pending) = self.pending.get(&node) {
                debug!(%node, old_deadline = ?pending.deadline, ?delay, "drop timer reset");
            }
            self.arm(node, delay);
        }
    }

    fn on_expired(&mut self, node: &str, generation: u64) {
        match self.pending.get(node) {
            Some(pending) if pending.generation == generation => {}
            _ => {
                debug!(%node, generation, "stale drop timer ignored");
                return;
            }
        }
        self.pending.remove(node);

        match self.dropper.drop_peer(node) {
            Ok(()) => {
                // The monitor state is kept: transports only announce changes,
                // so a peer back in maintenance would not be reported again.
                info!(%node, "peer dropped");
                self.bus.publish(Message::PeerDropped {
                    node: node.to_string(),
                });
            }
            Err(e) => error!(%node, error = %e, "drop peer failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDropper {
        dropped: Mutex<Vec<String>>,
        fail: bool,
    }

    impl PeerDropper for RecordingDropper {
        fn drop_peer(&self, node: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("store unavailable");
            }
            self.dropped.lock().unwrap().push(node.to_string());
            Ok(())
        }
    }

    impl RecordingDropper {
        fn dropped(&self) -> Vec<String> {
            self.dropped.lock().unwrap().clone()
        }
    }

    const GRACE: Duration = Duration::from_secs(60);

    fn start(dropper: Arc<RecordingDropper>) -> (Bus, CancellationToken) {
        let bus = Bus::default();
        let token = CancellationToken::new();
        let supervisor = PeerDropSupervisor::new(bus.clone(), dropper, GRACE);
        tokio::spawn(supervisor.run(token.clone()));
        (bus, token)
    }

    fn node_ping(bus: &Bus, node: &str, is_alive: bool) {
        bus.publish(Message::HbNodePing {
            node: node.to_string(),
            is_alive,
        });
    }

    fn maintenance(bus: &Bus, node: &str) {
        bus.publish(Message::NodeMonitorUpdated {
            node: node.to_string(),
            state: MonitorState::Maintenance,
        });
    }

    async fn advance(d: Duration) {
        tokio::time::sleep(d).await;
    }

    #[tokio::test(start_paused = true)]
    async fn non_maintenance_peer_dropped_promptly() {
        let dropper = Arc::new(RecordingDropper::default());
        let (bus, _token) = start(dropper.clone());
        let mut dropped = bus.subscribe("test");
        dropped.add_filter(MessageKind::PeerDropped);

        node_ping(&bus, "n2", false);
        advance(Duration::from_millis(10)).await;
        assert_eq!(dropper.dropped(), vec!["n2".to_string()]);
        assert_eq!(
            dropped.recv().await,
            Some(Message::PeerDropped {
                node: "n2".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_peer_waits_grace_period() {
        let dropper = Arc::new(RecordingDropper::default());
        let (bus, _token) = start(dropper.clone());

        maintenance(&bus, "n2");
        node_ping(&bus, "n2", false);
        advance(GRACE - Duration::from_secs(1)).await;
        assert!(dropper.dropped().is_empty());

        advance(Duration::from_secs(2)).await;
        assert_eq!(dropper.dropped(), vec!["n2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_outlives_a_drop() {
        let dropper = Arc::new(RecordingDropper::default());
        let (bus, _token) = start(dropper.clone());

        maintenance(&bus, "n2");
        node_ping(&bus, "n2", false);
        advance(GRACE + Duration::from_secs(1)).await;
        assert_eq!(dropper.dropped(), vec!["n2".to_string()]);

        // Back without a new monitor announcement, then out again.
        node_ping(&bus, "n2", true);
        node_ping(&bus, "n2", false);
        advance(Duration::from_secs(1)).await;
        assert_eq!(dropper.dropped().len(), 1);

        advance(GRACE).await;
        assert_eq!(dropper.dropped(), vec!["n2".to_string(), "n2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn alive_again_cancels_drop() {
        let dropper = Arc::new(RecordingDropper::default());
        let (bus, _token) = start(dropper.clone());

        maintenance(&bus, "n2");
        node_ping(&bus, "n2", false);
        advance(Duration::from_secs(30)).await;
        node_ping(&bus, "n2", true);
        advance(GRACE * 2).await;
        assert!(dropper.dropped().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_reload_restarts_timer_from_now() {
        let dropper = Arc::new(RecordingDropper::default());
        let (bus, _token) = start(dropper.clone());

        maintenance(&bus, "n2");
        node_ping(&bus, "n2", false);
        advance(Duration::from_secs(40)).await;

        // New grace of 30s: fires at reload + 30s, not earlier.
        bus.publish(Message::ClusterConfigUpdated {
            maintenance_grace_period: Duration::from_secs(30),
        });
        advance(Duration::from_secs(29)).await;
        assert!(dropper.dropped().is_empty());
        advance(Duration::from_secs(2)).await;
        assert_eq!(dropper.dropped(), vec!["n2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_drop_is_not_retried() {
        let dropper = Arc::new(RecordingDropper {
            fail: true,
            ..Default::default()
        });
        let (bus, _token) = start(dropper.clone());
        let mut dropped = bus.subscribe("test");
        dropped.add_filter(MessageKind::PeerDropped);

        node_ping(&bus, "n2", false);
        advance(GRACE * 3).await;
        let mut cx = std::task::Context::from_waker(std::task::Waker::noop());
        let mut recv = std::pin::pin!(dropped.recv());
        assert!(recv.as_mut().poll(&mut cx).is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn peers_are_independent() {
        let dropper = Arc::new(RecordingDropper::default());
        let (bus, _token) = start(dropper.clone());

        maintenance(&bus, "n2");
        node_ping(&bus, "n2", false);
        node_ping(&bus, "n3", false);
        advance(Duration::from_secs(1)).await;
        assert_eq!(dropper.dropped(), vec!["n3".to_string()]);
        advance(GRACE).await;
        assert_eq!(dropper.dropped(), vec!["n3".to_string(), "n2".to_string()]);
    }

    #[test]
    fn state_store_drops_peer() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_node(&pulsegrid_state::NodeRecord::new("n2"))
            .unwrap();
        PeerDropper::drop_peer(&store, "n2").unwrap();
        assert!(store.get_node("n2").unwrap().is_none());
    }
}
