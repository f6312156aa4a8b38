//! Atomically published cluster snapshot
//!
//! The shard map is immutable once published: `refresh` builds a fresh
//! map from the store's node keys and swaps the pointer. Readers load
//! the pointer once per operation and keep using their snapshot even if
//! a newer one lands mid-flight.

use super::{Node, Shard};
use crate::store::{Keys, MetaStore};
use crate::Result;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ClusterView {
    store: Arc<dyn MetaStore>,
    keys: Keys,
    shards: ArcSwap<HashMap<String, Arc<Shard>>>,
    refreshing: AtomicBool,
}

impl ClusterView {
    pub fn new(store: Arc<dyn MetaStore>, keys: Keys) -> Self {
        Self {
            store,
            keys,
            shards: ArcSwap::from_pointee(HashMap::new()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Rebuild the snapshot from the store's node keys.
    ///
    /// The only mutator, and idempotent. Concurrent callers coalesce:
    /// whoever loses the flag race returns immediately, subsumed by the
    /// refresh already in flight.
    pub async fn refresh(&self) -> Result<()> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let result = self.rebuild().await;
        self.refreshing.store(false, Ordering::SeqCst);
        result
    }

    async fn rebuild(&self) -> Result<()> {
        let pairs = self.store.get_prefix(&self.keys.node_prefix()).await?;

        let mut members: HashMap<String, (Option<Node>, Vec<Node>)> = HashMap::new();
        for (key, value) in pairs {
            let node: Node = match serde_json::from_str(&value) {
                Ok(node) => node,
                Err(e) => {
                    warn!(key, error = %e, "Skipping undecodable node key");
                    continue;
                }
            };

            let entry = members.entry(node.shard_id.clone()).or_default();
            if node.is_master() {
                entry.0 = Some(node);
            } else {
                entry.1.push(node);
            }
        }

        let shards: HashMap<String, Arc<Shard>> = members
            .into_iter()
            .map(|(id, (master, slaves))| {
                let shard = Arc::new(Shard::new(id.clone(), master, slaves));
                (id, shard)
            })
            .collect();

        debug!(shards = shards.len(), "Published new cluster view");
        self.shards.store(Arc::new(shards));
        Ok(())
    }

    /// The shard snapshot for one id, if known
    pub fn shard(&self, shard_id: &str) -> Option<Arc<Shard>> {
        self.shards.load().get(shard_id).cloned()
    }

    /// The full current snapshot
    pub fn all_shards(&self) -> Arc<HashMap<String, Arc<Shard>>> {
        self.shards.load_full()
    }

    /// Ids of every known shard, sorted for deterministic fan-out order
    pub fn shard_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shards.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn master(&self, shard_id: &str) -> Option<Node> {
        self.shards
            .load()
            .get(shard_id)
            .and_then(|s| s.master.clone())
    }

    pub fn slaves(&self, shard_id: &str) -> Vec<Node> {
        self.shards
            .load()
            .get(shard_id)
            .map(|s| s.slaves.clone())
            .unwrap_or_default()
    }

    /// Every master in the current snapshot, sorted by shard id
    pub fn masters(&self) -> Vec<Node> {
        let mut masters: Vec<Node> = self
            .shards
            .load()
            .values()
            .filter_map(|s| s.master.clone())
            .collect();
        masters.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        masters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn node_json(shard_id: &str, port: u16, master_port: &str) -> String {
        serde_json::json!({
            "shard_id": shard_id,
            "ip": "127.0.0.1",
            "port": port.to_string(),
            "master_ip": if master_port.is_empty() { "" } else { "127.0.0.1" },
            "master_port": master_port,
            "idc": "z1",
            "heartbeat_at": 0,
        })
        .to_string()
    }

    async fn seeded_view() -> (MemoryStore, Arc<ClusterView>) {
        let store = MemoryStore::new();
        let keys = Keys::new("/test");
        store
            .put(&keys.node_key("127.0.0.1:9001"), &node_json("1", 9001, ""), None)
            .await
            .unwrap();
        store
            .put(
                &keys.node_key("127.0.0.1:9002"),
                &node_json("1", 9002, "9001"),
                None,
            )
            .await
            .unwrap();
        store
            .put(&keys.node_key("127.0.0.1:9003"), &node_json("2", 9003, ""), None)
            .await
            .unwrap();

        let view = Arc::new(ClusterView::new(Arc::new(store.clone()), keys));
        view.refresh().await.unwrap();
        (store, view)
    }

    #[tokio::test]
    async fn test_refresh_classifies_masters_and_slaves() {
        let (_store, view) = seeded_view().await;

        let shard1 = view.shard("1").unwrap();
        assert_eq!(shard1.master.as_ref().unwrap().addr(), "127.0.0.1:9001");
        assert_eq!(shard1.slaves.len(), 1);
        assert_eq!(shard1.slaves[0].addr(), "127.0.0.1:9002");

        let shard2 = view.shard("2").unwrap();
        assert!(shard2.master.is_some());
        assert!(shard2.slaves.is_empty());
        assert!(view.shard("3").is_none());
    }

    #[tokio::test]
    async fn test_every_master_belongs_to_its_shard() {
        let (_store, view) = seeded_view().await;

        for (id, shard) in view.all_shards().iter() {
            if let Some(master) = &shard.master {
                assert_eq!(&master.shard_id, id);
                assert!(master.is_master());
            }
        }
    }

    #[tokio::test]
    async fn test_masters_sorted_by_shard_id() {
        let (_store, view) = seeded_view().await;

        let masters = view.masters();
        assert_eq!(masters.len(), 2);
        assert_eq!(masters[0].shard_id, "1");
        assert_eq!(masters[1].shard_id, "2");
    }

    #[tokio::test]
    async fn test_old_snapshot_survives_refresh() {
        let (store, view) = seeded_view().await;

        let old = view.all_shards();
        let keys = Keys::new("/test");
        store.delete(&keys.node_key("127.0.0.1:9003")).await.unwrap();
        view.refresh().await.unwrap();

        // The reader's snapshot is untouched; the new one dropped shard 2.
        assert!(old.contains_key("2"));
        assert!(view.shard("2").is_none());
    }

    #[tokio::test]
    async fn test_node_address_in_at_most_one_shard() {
        let (_store, view) = seeded_view().await;

        let mut seen = std::collections::HashSet::new();
        for shard in view.all_shards().values() {
            for node in shard.master.iter().chain(shard.slaves.iter()) {
                assert!(seen.insert(node.addr()), "{} listed twice", node.addr());
            }
        }
    }
}
