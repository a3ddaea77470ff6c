//! pulsegrid-bus: in-process publish/subscribe bus of the PulseGrid daemon.
//!
//! Producers publish [`Message`]s; each message is stamped with a label set
//! (`node=<name>` for node-scoped messages) so that subscribers can filter
//! by message kind and label without seeing unrelated traffic.
//!
//! ```text
//! hb control core ──HbNodePing/HbPing/HbStale──┐
//! hb receivers ─────NodeMonitorUpdated─────────┼──► Bus ──► Subscription(filters)
//! config watcher ───ClusterConfigUpdated───────┘
//! ```

pub mod bus;
pub mod message;

pub use bus::{Bus, Filter, Subscription};
pub use message::{Labels, Message, MessageKind};
