//! StateStore: redb-backed cluster data persistence for PulseGrid.
//!
//! Provides typed CRUD operations over node records and per-node status
//! documents. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(NODE_STATUS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a node record by name.
    pub fn get_node(&self, name: &str) -> StateResult<Option<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: NodeRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all node records.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: NodeRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Read-modify-write a node record, creating it if absent.
    pub fn update_node<F>(&self, name: &str, f: F) -> StateResult<NodeRecord>
    where
        F: FnOnce(&mut NodeRecord),
    {
        let mut node = self
            .get_node(name)?
            .unwrap_or_else(|| NodeRecord::new(name));
        f(&mut node);
        self.put_node(&node)?;
        Ok(node)
    }

    // ── Status documents ───────────────────────────────────────────

    /// Insert or update a status document.
    pub fn put_status(&self, doc: &StatusDoc) -> StateResult<()> {
        let key = doc.table_key();
        let value = serde_json::to_vec(doc).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODE_STATUS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get one status document of a node.
    pub fn get_status(&self, node: &str, key: &str) -> StateResult<Option<StatusDoc>> {
        let key = status_key(node, key);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODE_STATUS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let doc: StatusDoc =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// List the status documents of a node (by key prefix scan).
    pub fn list_status_for_node(&self, node: &str) -> StateResult<Vec<StatusDoc>> {
        let prefix = status_key(node, "");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODE_STATUS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let doc: StatusDoc =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(doc);
            }
        }
        Ok(results)
    }

    // ── Peer drop ──────────────────────────────────────────────────

    /// Remove every row owned by a node: its record and all its status
    /// documents. Returns the number of rows removed.
    pub fn drop_peer_node(&self, node: &str) -> StateResult<u32> {
        let prefix = status_key(node, "");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            if nodes.remove(node).map_err(map_err!(Write))?.is_some() {
                count += 1;
            }

            // Keys sort by node, so the node's documents are one contiguous run.
            let mut status = txn.open_table(NODE_STATUS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in status.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let key = key.value();
                if !key.starts_with(&prefix) {
                    break;
                }
                keys.push(key.to_string());
            }
            for key in &keys {
                if status.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%node, rows = count, "peer node state dropped");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::MonitorState;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn test_doc(node: &str, key: &str) -> StatusDoc {
        StatusDoc {
            node: node.to_string(),
            key: key.to_string(),
            value: serde_json::json!({ "key": key }),
            updated_at: 1000,
        }
    }

    #[test]
    fn node_put_and_get() {
        let store = test_store();
        let mut node = NodeRecord::new("n1");
        node.monitor_state = MonitorState::Maintenance;
        store.put_node(&node).unwrap();

        let got = store.get_node("n1").unwrap().unwrap();
        assert_eq!(got, node);
        assert!(store.get_node("n2").unwrap().is_none());
    }

    #[test]
    fn update_node_creates_then_modifies() {
        let store = test_store();
        let node = store.update_node("n1", |n| n.alive = true).unwrap();
        assert!(node.alive);
        assert_eq!(node.monitor_state, MonitorState::Idle);

        store
            .update_node("n1", |n| n.monitor_state = MonitorState::Upgrade)
            .unwrap();
        let got = store.get_node("n1").unwrap().unwrap();
        assert!(got.alive);
        assert_eq!(got.monitor_state, MonitorState::Upgrade);
        assert_eq!(store.list_nodes().unwrap().len(), 1);
    }

    #[test]
    fn status_scan_is_per_node() {
        let store = test_store();
        store.put_status(&test_doc("n1", "hb")).unwrap();
        store.put_status(&test_doc("n1", "objects")).unwrap();
        store.put_status(&test_doc("n10", "hb")).unwrap();

        assert_eq!(store.list_status_for_node("n1").unwrap().len(), 2);
        assert_eq!(store.list_status_for_node("n10").unwrap().len(), 1);
        assert!(store.get_status("n1", "hb").unwrap().is_some());
        assert!(store.get_status("n2", "hb").unwrap().is_none());
    }

    #[test]
    fn drop_peer_node_removes_only_that_node() {
        let store = test_store();
        store.put_node(&NodeRecord::new("n1")).unwrap();
        store.put_node(&NodeRecord::new("n2")).unwrap();
        store.put_status(&test_doc("n1", "hb")).unwrap();
        store.put_status(&test_doc("n1", "objects")).unwrap();
        store.put_status(&test_doc("n2", "hb")).unwrap();

        let removed = store.drop_peer_node("n1").unwrap();
        assert_eq!(removed, 3);
        assert!(store.get_node("n1").unwrap().is_none());
        assert!(store.list_status_for_node("n1").unwrap().is_empty());

        assert!(store.get_node("n2").unwrap().is_some());
        assert_eq!(store.list_status_for_node("n2").unwrap().len(), 1);
    }

    #[test]
    fn drop_peer_node_stops_at_neighbouring_keys() {
        let store = test_store();
        for node in ["n0", "n1", "n1-b", "n10", "n2"] {
            store.put_status(&test_doc(node, "hb/hb#1.rx")).unwrap();
            store.put_status(&test_doc(node, "hb/hb#2.rx")).unwrap();
        }

        assert_eq!(store.drop_peer_node("n1").unwrap(), 2);
        assert!(store.list_status_for_node("n1").unwrap().is_empty());
        for node in ["n0", "n1-b", "n10", "n2"] {
            assert_eq!(store.list_status_for_node(node).unwrap().len(), 2, "{node}");
        }
    }

    #[test]
    fn drop_unknown_node_is_noop() {
        let store = test_store();
        assert_eq!(store.drop_peer_node("ghost").unwrap(), 0);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.put_node(&NodeRecord::new("n1")).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_node("n1").unwrap().is_some());
    }
}
