//! redb table definitions for the PulseGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Node records keyed by `{node}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Status documents keyed by `{node}/{key}`.
pub const NODE_STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("node_status");
