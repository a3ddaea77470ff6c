//! Configuration watcher.
//!
//! Polls the modification time of the cluster configuration file. On a
//! change it reloads and validates the file; a valid reload is announced on
//! the bus as `ClusterConfigUpdated` and updates the monitor state this
//! node advertises. An invalid file is logged and the previous
//! configuration stays in effect.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use pulse_core::{ClusterConfig, MonitorState};
use pulsegrid_bus::{Bus, Message};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct ConfigWatcher {
    path: PathBuf,
    poll: Duration,
    current: ClusterConfig,
    last_modified: Option<SystemTime>,
    bus: Bus,
    monitor: watch::Sender<MonitorState>,
}

impl ConfigWatcher {
    pub fn new(
        path: PathBuf,
        current: ClusterConfig,
        bus: Bus,
        monitor: watch::Sender<MonitorState>,
    ) -> Self {
        let last_modified = modified(&path);
        Self {
            path,
            poll: POLL_INTERVAL,
            current,
            last_modified,
            bus,
            monitor,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.poll_once(),
            }
        }
        debug!("config watcher stopped");
    }

    fn poll_once(&mut self) {
        let now = modified(&self.path);
        if now.is_none() || now == self.last_modified {
            return;
        }
        self.last_modified = now;

        let config = match ClusterConfig::from_file(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config reload failed, keeping previous");
                return;
            }
        };
        let grace = match config.maintenance_grace_period() {
            Ok(g) => g,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config reload failed, keeping previous");
                return;
            }
        };
        if config.node.name != self.current.node.name || config.cluster.name != self.current.cluster.name {
            warn!("cluster or node name changed; takes effect on restart");
        }
        if config.hb.len() != self.current.hb.len() {
            warn!("heartbeat list changed; takes effect on restart");
        }

        info!(path = %self.path.display(), grace_period = ?grace, monitor_state = %config.node.monitor_state, "config reloaded");
        self.monitor.send_if_modified(|state| {
            let changed = *state != config.node.monitor_state;
            *state = config.node.monitor_state;
            changed
        });
        self.bus.publish(Message::ClusterConfigUpdated {
            maintenance_grace_period: grace,
        });
        self.current = config;
    }
}

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
