//! Plumbing shared by every transport.
//!
//! A transport runs two loops per configured heartbeat: a tx loop sending
//! the local payload every interval and an rx loop turning peer payloads
//! into `SetPeerSuccess` reports. Both ids are registered with the control
//! core and watch every peer for the lifetime of the transport.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use pulse_core::{ClusterConfig, HbConfig, HbKind, MonitorState};
use pulsegrid_bus::{Bus, Message};
use pulsegrid_hb::{CtrlHandle, HeartbeatId};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::message::HbMessage;

/// Local node identity and the services transports report to.
#[derive(Clone)]
pub struct HbContext {
    pub cluster: String,
    pub node: String,
    /// Every cluster member, local node included, in configuration order.
    pub nodes: Vec<String>,
    pub ctrl: CtrlHandle,
    pub bus: Bus,
    /// Monitor state advertised in outgoing payloads.
    pub monitor: watch::Receiver<MonitorState>,
}

impl HbContext {
    pub fn new(
        config: &ClusterConfig,
        ctrl: CtrlHandle,
        bus: Bus,
        monitor: watch::Receiver<MonitorState>,
    ) -> Self {
        Self {
            cluster: config.cluster.name.clone(),
            node: config.node.name.clone(),
            nodes: config.cluster.nodes.clone(),
            ctrl,
            bus,
            monitor,
        }
    }

    pub fn peers(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| **n != self.node)
            .cloned()
            .collect()
    }

    pub fn node_index(&self, node: &str) -> TransportResult<usize> {
        self.nodes
            .iter()
            .position(|n| n == node)
            .ok_or_else(|| TransportError::UnknownNode(node.to_string()))
    }

    /// Fresh payload stamped with the current time and monitor state.
    pub fn payload(&self) -> HbMessage {
        HbMessage::new(&self.cluster, &self.node, *self.monitor.borrow())
    }
}

/// Name, ids and timing of one configured heartbeat.
#[derive(Debug, Clone)]
pub struct HbSettings {
    pub name: String,
    pub kind: HbKind,
    pub interval: Duration,
    pub timeout: Duration,
}

impl HbSettings {
    pub fn from_config(hb: &HbConfig) -> TransportResult<Self> {
        Ok(Self {
            name: hb.name.clone(),
            kind: hb.driver.kind(),
            interval: hb.interval()?,
            timeout: hb.timeout()?,
        })
    }

    pub fn tx_id(&self) -> HeartbeatId {
        HeartbeatId::tx(&self.name)
    }

    pub fn rx_id(&self) -> HeartbeatId {
        HeartbeatId::rx(&self.name)
    }
}

/// Tasks and watchers of a started transport.
pub(crate) struct Running {
    token: CancellationToken,
    tasks: JoinSet<()>,
    ctrl: CtrlHandle,
    peers: Vec<String>,
}

impl Running {
    /// Register both ids, mark them running and watch every peer.
    pub(crate) async fn begin(
        settings: &HbSettings,
        ctx: &HbContext,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let peers = ctx.peers();
        for id in [settings.tx_id(), settings.rx_id()] {
            ctx.ctrl.register(id.clone(), settings.kind).await;
            ctx.ctrl.set_state(id.clone(), "running").await;
            for peer in &peers {
                ctx.ctrl
                    .add_watcher(id.clone(), peer, &token, settings.timeout)
                    .await;
            }
        }
        info!(hb = %settings.name, kind = %settings.kind, peers = peers.len(), "heartbeat started");
        Self {
            token,
            tasks: JoinSet::new(),
            ctrl: ctx.ctrl.clone(),
            peers,
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Cancel the loops, drop the watchers and unregister both ids.
    pub(crate) async fn stop(mut self, settings: &HbSettings) {
        self.token.cancel();
        for id in [settings.tx_id(), settings.rx_id()] {
            for peer in &self.peers {
                self.ctrl.del_watcher(id.clone(), peer).await;
            }
        }
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!(hb = %settings.name, error = %e, "heartbeat task failed");
            }
        }
        for id in [settings.tx_id(), settings.rx_id()] {
            self.ctrl.set_state(id.clone(), "stopped").await;
            self.ctrl.unregister(id).await;
        }
        info!(hb = %settings.name, "heartbeat stopped");
    }
}

/// Per-round send strategy of a tx loop.
pub(crate) trait BeatSender: Send + 'static {
    /// Send `msg` once and return the outcome for each peer reached (or not).
    fn send(&mut self, msg: &HbMessage) -> impl Future<Output = Vec<(String, bool)>> + Send;
}

/// Send the local payload every `interval` until cancelled.
pub(crate) async fn tx_loop<S: BeatSender>(
    mut sender: S,
    ctx: HbContext,
    id: HeartbeatId,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let msg = ctx.payload();
        let results = tokio::select! {
            _ = token.cancelled() => break,
            results = sender.send(&msg) => results,
        };
        for (peer, ok) in results {
            ctx.ctrl.set_peer_success(&peer, id.clone(), ok).await;
        }
    }
    debug!(hb_id = %id, "tx loop stopped");
}

#[derive(Debug, Default)]
struct PeerSeen {
    /// Baseline for polled payloads, `None` until the first poll.
    sent_at_ms: Option<u64>,
    monitor_state: Option<MonitorState>,
}

/// Rx side bookkeeping: filters foreign payloads, reports success to the
/// control core and publishes peer monitor state changes.
pub(crate) struct RxPeers {
    ctx: HbContext,
    id: HeartbeatId,
    seen: HashMap<String, PeerSeen>,
}

impl RxPeers {
    pub(crate) fn new(ctx: HbContext, id: HeartbeatId) -> Self {
        let seen = ctx
            .peers()
            .into_iter()
            .map(|p| (p, PeerSeen::default()))
            .collect();
        Self { ctx, id, seen }
    }

    pub(crate) fn peers(&self) -> Vec<String> {
        self.ctx.peers()
    }

    /// A pushed payload: any valid one from a peer counts as a beat.
    pub(crate) async fn received(&mut self, msg: HbMessage) {
        if let Some(peer) = self.accept(&msg, None) {
            self.ctx.ctrl.set_peer_success(&peer, self.id.clone(), true).await;
        }
    }

    /// A polled payload: counts as a beat only if `sent_at_ms` advanced
    /// since the previous poll of `peer`. The first poll only sets the
    /// baseline, so a payload left behind by a dead peer is not a beat.
    pub(crate) async fn polled(&mut self, peer: &str, msg: HbMessage) {
        let Some(peer) = self.accept(&msg, Some(peer)) else {
            return;
        };
        let Some(seen) = self.seen.get_mut(&peer) else {
            return;
        };
        match seen.sent_at_ms {
            None => {
                debug!(hb_id = %self.id, %peer, sent_at_ms = msg.sent_at_ms, "peer payload baseline");
                seen.sent_at_ms = Some(msg.sent_at_ms);
            }
            Some(prev) if msg.sent_at_ms > prev => {
                seen.sent_at_ms = Some(msg.sent_at_ms);
                self.ctx.ctrl.set_peer_success(&peer, self.id.clone(), true).await;
            }
            Some(_) => {}
        }
    }

    pub(crate) async fn failed(&mut self, peer: &str) {
        self.ctx.ctrl.set_peer_success(peer, self.id.clone(), false).await;
    }

    fn accept(&mut self, msg: &HbMessage, expected: Option<&str>) -> Option<String> {
        if msg.cluster != self.ctx.cluster {
            debug!(hb_id = %self.id, cluster = %msg.cluster, node = %msg.node, "payload from foreign cluster ignored");
            return None;
        }
        if expected.is_some_and(|p| p != msg.node) {
            debug!(hb_id = %self.id, node = %msg.node, "payload in wrong place ignored");
            return None;
        }
        let Some(seen) = self.seen.get_mut(&msg.node) else {
            debug!(hb_id = %self.id, node = %msg.node, "payload from unknown node ignored");
            return None;
        };
        if seen.monitor_state != Some(msg.monitor_state) {
            seen.monitor_state = Some(msg.monitor_state);
            debug!(hb_id = %self.id, node = %msg.node, state = %msg.monitor_state, "peer monitor state changed");
            self.ctx.bus.publish(Message::NodeMonitorUpdated {
                node: msg.node.clone(),
                state: msg.monitor_state,
            });
        }
        Some(msg.node.clone())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use pulsegrid_hb::Ctrl;

    use super::*;

    /// Control core plus a context for node `n1` of cluster `c1` = {n1, n2, n3}.
    pub(crate) fn context(token: &CancellationToken) -> HbContext {
        let bus = Bus::default();
        let (ctrl, handle) = Ctrl::new(bus.clone());
        tokio::spawn(ctrl.run(token.clone()));
        let (_monitor_tx, monitor) = watch::channel(MonitorState::Idle);
        HbContext {
            cluster: "c1".to_string(),
            node: "n1".to_string(),
            nodes: vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
            ctrl: handle,
            bus,
            monitor,
        }
    }

    /// Poll `check` every 10ms until it holds or 5s pass.
    pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}
