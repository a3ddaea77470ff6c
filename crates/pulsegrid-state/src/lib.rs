//! pulsegrid-state: embedded cluster data store for PulseGrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds the per-node cluster state
//! a node caches about its peers: the node record (advertised monitor state,
//! last aggregated liveness) and free-form status documents.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Status documents use composite `{node}/{key}` keys so that every row
//! owned by a node can be found with a prefix scan, which is what
//! [`StateStore::drop_peer_node`] relies on.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
