//! `pulsed run`: wires the heartbeat subsystems of one node together.
//!
//! 1. Loads the cluster configuration and opens the local data store
//! 2. Spawns the control core, peer-drop supervisor, state recorder and
//!    config watcher under one root cancellation token
//! 3. Starts every configured heartbeat transport
//! 4. On Ctrl-C stops the transports, cancels the root token and waits
//!    for every task

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pulse_core::ClusterConfig;
use pulsegrid_bus::Bus;
use pulsegrid_hb::{Ctrl, PeerDropSupervisor, StatusCache};
use pulsegrid_state::StateStore;
use pulsegrid_transport::{HbContext, Transport};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config_watch::ConfigWatcher;
use crate::recorder::StateRecorder;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(config_path: PathBuf, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("PulseGrid daemon starting");

    let config = ClusterConfig::from_file(&config_path)
        .with_context(|| format!("invalid configuration {}", config_path.display()))?;
    if config.hb.is_empty() {
        anyhow::bail!("no heartbeat configured in {}", config_path.display());
    }
    info!(cluster = %config.cluster.name, node = %config.node.name, peers = config.peers().len(), "configuration loaded");

    // ── Local data store ─────────────────────────────────────────
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("pulsegrid.redb");
    let store = StateStore::open(&db_path)?;
    store.update_node(&config.node.name, |r| {
        r.monitor_state = config.node.monitor_state;
        r.alive = true;
    })?;
    info!(path = ?db_path, "state store opened");

    let bus = Bus::default();
    let root = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // ── Control core ─────────────────────────────────────────────
    let (ctrl, handle) = Ctrl::new(bus.clone());
    let status = ctrl.status_cache();
    tasks.spawn(ctrl.run(root.clone()));

    // ── Peer drop, recorder, status log ──────────────────────────
    let supervisor = PeerDropSupervisor::new(
        bus.clone(),
        Arc::new(store.clone()),
        config.maintenance_grace_period()?,
    );
    tasks.spawn(supervisor.run(root.clone()));
    tasks.spawn(StateRecorder::new(&bus, store.clone()).run(root.clone()));
    tasks.spawn(log_status(status, root.clone()));

    // ── Config watcher ───────────────────────────────────────────
    let (monitor_tx, monitor_rx) = watch::channel(config.node.monitor_state);
    let watcher = ConfigWatcher::new(config_path.clone(), config.clone(), bus.clone(), monitor_tx);
    tasks.spawn(watcher.run(root.clone()));

    // ── Transports ───────────────────────────────────────────────
    let ctx = HbContext::new(&config, handle, bus.clone(), monitor_rx);
    let mut transports = Vec::with_capacity(config.hb.len());
    for hb in &config.hb {
        let mut transport = Transport::from_config(hb)?;
        if let Err(e) = transport.start(&ctx, &root).await {
            stop_all(&mut transports).await;
            root.cancel();
            return Err(e).with_context(|| format!("failed to start heartbeat {}", hb.name));
        }
        transports.push(transport);
    }
    info!(count = transports.len(), "heartbeats running");

    // ── Wait for shutdown ────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    stop_all(&mut transports).await;
    root.cancel();
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "task failed during shutdown");
        }
    }

    info!("PulseGrid daemon stopped");
    Ok(())
}

async fn stop_all(transports: &mut [Transport]) {
    for transport in transports.iter_mut() {
        transport.stop().await;
    }
}

/// Periodically log the heartbeat status table.
async fn log_status(status: StatusCache, token: CancellationToken) {
    let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for thread in status.snapshot().iter() {
            let beating = thread.peers.values().filter(|p| p.beating).count();
            debug!(
                hb_id = %thread.id,
                kind = %thread.kind,
                state = %thread.state,
                beating,
                peers = thread.peers.len(),
                "heartbeat status"
            );
        }
    }
}
