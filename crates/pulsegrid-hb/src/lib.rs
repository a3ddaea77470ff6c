//! pulsegrid-hb: heartbeat control subsystem of the PulseGrid agent.
//!
//! Tracks, per heartbeat id and per peer node, whether the peer is beating
//! or stale, collapses the per-transport signals into one alive/dead edge
//! per node, and purges the cluster state of peers that stay dead.
//!
//! # Architecture
//!
//! ```text
//! transports (tx/rx loops)
//!   │  CtrlHandle: register / add_watcher / set_peer_success / ...
//!   ▼
//! Ctrl (single task, owns all state)
//!   ├── PeerWatcher task per (hb id, peer)
//!   │     beat(true|false) / timeout → Cmd::Event(hb_beating | hb_stale)
//!   ├── status table  ──1s tick──► StatusCache (read-only snapshot)
//!   └── Aggregator (rx beating count per peer)
//!         └── 0↔1 edge → Bus: HbNodePing { node, is_alive }
//!                           │
//!                           ▼
//!                 PeerDropSupervisor
//!                   └── grace timer → PeerDropper::drop_peer(node)
//! ```
//!
//! The `Ctrl` task is the only writer of the status table and the
//! aggregator; every other component talks to it through its command
//! channel, which orders all mutations.

pub mod aggregator;
pub mod ctrl;
pub mod id;
pub mod peer_drop;
pub mod status;
pub mod watcher;

pub use aggregator::{Aggregator, RemoteBeating};
pub use ctrl::{Cmd, Ctrl, CtrlHandle};
pub use id::{Direction, HeartbeatId};
pub use peer_drop::{PeerDropSupervisor, PeerDropper};
pub use status::{HeartbeatThreadStatus, PeerStatus, StatusCache};
pub use watcher::EventKind;
