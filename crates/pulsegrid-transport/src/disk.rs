//! Shared-disk heartbeat.
//!
//! All nodes share one slot file (a raw device or a file on shared
//! storage). Node `i`, its position in `cluster.nodes`, owns the 4 KiB
//! slot at `i × 4096` and rewrites it every interval; every node reads the
//! peer slots on the same interval and treats an advanced `sent_at_ms` as
//! a beat.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::driver::{BeatSender, HbContext, HbSettings, Running, RxPeers, tx_loop};
use crate::error::{TransportError, TransportResult};
use crate::message::{HbMessage, MAX_PAYLOAD};

pub const SLOT_SIZE: u64 = MAX_PAYLOAD as u64;

pub struct Disk {
    settings: HbSettings,
    dev: PathBuf,
    running: Option<Running>,
}

impl Disk {
    pub fn new(settings: HbSettings, dev: PathBuf) -> Self {
        Self {
            settings,
            dev,
            running: None,
        }
    }

    pub fn settings(&self) -> &HbSettings {
        &self.settings
    }

    pub async fn start(&mut self, ctx: &HbContext, parent: &CancellationToken) -> TransportResult<()> {
        if self.running.is_some() {
            return Err(TransportError::AlreadyRunning(self.settings.name.clone()));
        }
        let slot = ctx.node_index(&ctx.node)?;
        let mut peer_slots = Vec::new();
        for peer in ctx.peers() {
            let index = ctx.node_index(&peer)?;
            peer_slots.push((peer, index));
        }
        // Fail early on a missing or unwritable device.
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.dev)
            .await?;

        let mut running = Running::begin(&self.settings, ctx, parent).await;
        let sender = DiskWriter {
            dev: self.dev.clone(),
            slot,
            peers: ctx.peers(),
        };
        running.spawn(tx_loop(
            sender,
            ctx.clone(),
            self.settings.tx_id(),
            self.settings.interval,
            running.token(),
        ));
        running.spawn(rx_loop(
            self.dev.clone(),
            peer_slots,
            self.settings.interval,
            RxPeers::new(ctx.clone(), self.settings.rx_id()),
            running.token(),
        ));
        self.running = Some(running);
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop(&self.settings).await;
        }
    }
}

pub async fn write_slot(dev: &Path, slot: usize, msg: &HbMessage) -> TransportResult<()> {
    let mut block = msg.encode()?;
    block.resize(MAX_PAYLOAD, 0);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(dev)
        .await?;
    file.seek(SeekFrom::Start(slot as u64 * SLOT_SIZE)).await?;
    file.write_all(&block).await?;
    file.sync_data().await?;
    Ok(())
}

/// Read one slot. `None` for a slot nobody has written yet.
pub async fn read_slot(dev: &Path, slot: usize) -> TransportResult<Option<HbMessage>> {
    let mut file = OpenOptions::new().read(true).open(dev).await?;
    file.seek(SeekFrom::Start(slot as u64 * SLOT_SIZE)).await?;
    let mut block = Vec::with_capacity(MAX_PAYLOAD);
    file.take(SLOT_SIZE).read_to_end(&mut block).await?;
    if block.iter().all(|b| *b == 0) {
        return Ok(None);
    }
    HbMessage::decode(&block).map(Some)
}

struct DiskWriter {
    dev: PathBuf,
    slot: usize,
    peers: Vec<String>,
}

impl BeatSender for DiskWriter {
    /// A successful slot write counts for every peer.
    async fn send(&mut self, msg: &HbMessage) -> Vec<(String, bool)> {
        let ok = match write_slot(&self.dev, self.slot, msg).await {
            Ok(()) => true,
            Err(e) => {
                warn!(dev = %self.dev.display(), slot = self.slot, error = %e, "disk heartbeat write failed");
                false
            }
        };
        self.peers.iter().map(|p| (p.clone(), ok)).collect()
    }
}

async fn rx_loop(
    dev: PathBuf,
    peer_slots: Vec<(String, usize)>,
    interval: Duration,
    mut peers: RxPeers,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for (peer, slot) in &peer_slots {
            match read_slot(&dev, *slot).await {
                Ok(Some(msg)) => peers.polled(peer, msg).await,
                Ok(None) => {}
                Err(e) => {
                    debug!(%peer, slot, error = %e, "disk heartbeat read failed");
                    peers.failed(peer).await;
                }
            }
        }
    }
    debug!(dev = %dev.display(), "disk rx loop stopped");
}
