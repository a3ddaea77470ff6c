//! Peer watcher: debounces one (heartbeat id, peer) beat stream.
//!
//! A watcher turns `beat(true)`, `beat(false)` and silence into discrete
//! `hb_beating`/`hb_stale` events sent to the control core. A positive
//! beat (re)arms a dead-man's timer of `timeout`; when it fires while
//! beating, the peer goes stale. An explicit negative beat while beating
//! goes stale immediately instead of waiting out the timer.

use std::fmt;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ctrl::Cmd;
use crate::id::HeartbeatId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Beating,
    Stale,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Beating => "hb_beating",
            EventKind::Stale => "hb_stale",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition logic, kept free of timers.
#[derive(Debug, Default)]
struct PeerWatch {
    beating: bool,
}

impl PeerWatch {
    fn on_beat(&mut self, success: bool) -> Option<EventKind> {
        match (self.beating, success) {
            (false, true) => {
                self.beating = true;
                Some(EventKind::Beating)
            }
            (true, false) => {
                self.beating = false;
                Some(EventKind::Stale)
            }
            _ => None,
        }
    }

    fn on_timeout(&mut self) -> Option<EventKind> {
        if self.beating {
            self.beating = false;
            Some(EventKind::Stale)
        } else {
            None
        }
    }
}

/// Control core's grip on a running watcher.
pub(crate) struct WatcherHandle {
    /// Stamped on every event this watcher raises.
    pub(crate) generation: u64,
    beat_tx: mpsc::UnboundedSender<bool>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Forward a beat signal. Never blocks the caller.
    pub(crate) fn beat(&self, success: bool) {
        let _ = self.beat_tx.send(success);
    }

    pub(crate) fn cancel(self) {
        self.token.cancel();
        drop(self.task);
    }
}

/// Spawn a watcher for `peer` under `id`. It stops when `token` (or any
/// parent of it) is cancelled.
pub(crate) fn spawn(
    id: HeartbeatId,
    peer: String,
    generation: u64,
    timeout: Duration,
    token: CancellationToken,
    events: mpsc::Sender<Cmd>,
) -> WatcherHandle {
    let (beat_tx, beat_rx) = mpsc::unbounded_channel();
    let watcher = PeerWatcher {
        id,
        peer,
        generation,
        timeout,
        state: PeerWatch::default(),
        beat_rx,
        events,
        token: token.clone(),
    };
    let task = tokio::spawn(watcher.run());
    WatcherHandle {
        generation,
        beat_tx,
        token,
        task,
    }
}

struct PeerWatcher {
    id: HeartbeatId,
    peer: String,
    generation: u64,
    timeout: Duration,
    state: PeerWatch,
    beat_rx: mpsc::UnboundedReceiver<bool>,
    events: mpsc::Sender<Cmd>,
    token: CancellationToken,
}

impl PeerWatcher {
    async fn run(mut self) {
        debug!(hb_id = %self.id, peer = %self.peer, timeout = ?self.timeout, "peer watcher started");

        let timer = tokio::time::sleep(self.timeout);
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                beat = self.beat_rx.recv() => {
                    let Some(success) = beat else { break };
                    trace!(hb_id = %self.id, peer = %self.peer, success, "beat");
                    if success {
                        timer.as_mut().reset(Instant::now() + self.timeout);
                        armed = true;
                    }
                    let event = self.state.on_beat(success);
                    if event == Some(EventKind::Stale) {
                        armed = false;
                    }
                    event
                }
                _ = &mut timer, if armed => {
                    armed = false;
                    self.state.on_timeout()
                }
            };

            if let Some(kind) = event {
                debug!(hb_id = %self.id, peer = %self.peer, event = %kind, "peer transition");
                let cmd = Cmd::Event {
                    kind,
                    peer: self.peer.clone(),
                    id: self.id.clone(),
                    generation: self.generation,
                    at: SystemTime::now(),
                };
                if self.events.send(cmd).await.is_err() {
                    break;
                }
            }
        }

        debug!(hb_id = %self.id, peer = %self.peer, "peer watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_on_change() {
        let mut w = PeerWatch::default();
        assert_eq!(w.on_beat(false), None);
        assert_eq!(w.on_timeout(), None);
        assert_eq!(w.on_beat(true), Some(EventKind::Beating));
        assert_eq!(w.on_beat(true), None);
        assert_eq!(w.on_beat(false), Some(EventKind::Stale));
        assert_eq!(w.on_beat(false), None);
        assert_eq!(w.on_beat(true), Some(EventKind::Beating));
        assert_eq!(w.on_timeout(), Some(EventKind::Stale));
        assert_eq!(w.on_timeout(), None);
    }

    fn start(timeout: Duration) -> (WatcherHandle, mpsc::Receiver<Cmd>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = spawn(
            HeartbeatId::rx("hb#1"),
            "n2".to_string(),
            7,
            timeout,
            CancellationToken::new(),
            tx,
        );
        (handle, rx)
    }

    fn event_kind(cmd: Cmd) -> EventKind {
        match cmd {
            Cmd::Event {
                kind,
                peer,
                id,
                generation,
                ..
            } => {
                assert_eq!(peer, "n2");
                assert_eq!(generation, 7);
                assert_eq!(id.as_str(), "hb#1.rx");
                kind
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_beats_emit_one_beating_event() {
        let (handle, mut rx) = start(Duration::from_secs(10));
        for _ in 0..5 {
            handle.beat(true);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(event_kind(rx.recv().await.unwrap()), EventKind::Beating);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_once() {
        let (handle, mut rx) = start(Duration::from_secs(10));
        handle.beat(true);
        assert_eq!(event_kind(rx.recv().await.unwrap()), EventKind::Beating);

        // Still beating just before the deadline.
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(event_kind(rx.recv().await.unwrap()), EventKind::Stale);

        // Nothing more until the next positive beat.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());

        handle.beat(true);
        assert_eq!(event_kind(rx.recv().await.unwrap()), EventKind::Beating);
    }

    #[tokio::test(start_paused = true)]
    async fn beats_push_the_deadline() {
        let (handle, mut rx) = start(Duration::from_secs(10));
        handle.beat(true);
        assert_eq!(event_kind(rx.recv().await.unwrap()), EventKind::Beating);
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(8)).await;
            handle.beat(true);
        }
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_failure_is_immediate() {
        let (handle, mut rx) = start(Duration::from_secs(3600));
        handle.beat(true);
        assert_eq!(event_kind(rx.recv().await.unwrap()), EventKind::Beating);
        handle.beat(false);
        assert_eq!(event_kind(rx.recv().await.unwrap()), EventKind::Stale);
        handle.beat(false);
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_task() {
        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let handle = spawn(
            HeartbeatId::rx("hb#1"),
            "n2".to_string(),
            7,
            Duration::from_secs(1),
            token.child_token(),
            tx,
        );
        handle.beat(true);
        assert_eq!(event_kind(rx.recv().await.unwrap()), EventKind::Beating);

        // Cancelling the parent reaches the watcher; its sender drops.
        token.cancel();
        assert!(rx.recv().await.is_none());
    }
}
