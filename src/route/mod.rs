//! Per-metric per-day routing
//!
//! Maps `(metric, day)` to the shard group responsible for it. Hits are
//! lock-free; a miss serialises per metric so a burst of concurrent
//! requests for the same cold entry costs a single consensus-store
//! round-trip. Global uniqueness of an allocation is enforced by the
//! store's conditional put, not by the in-process lock.

use crate::config::RouteConfig;
use crate::schema::Labels;
use crate::store::{Keys, MetaStore};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cached routing state of one metric
pub struct RouteInfo {
    /// Serialises the miss → store read → allocate → write section
    fill_lock: tokio::sync::Mutex<()>,
    state: RwLock<RouteState>,
}

#[derive(Default)]
struct RouteState {
    /// Shard-group route key used by external routing policy
    group_route_key: String,
    /// Most recently written day; deleting it evicts the whole metric
    timeline: Option<i64>,
    by_day: HashMap<i64, Vec<String>>,
}

impl RouteInfo {
    fn new() -> Self {
        Self {
            fill_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(RouteState::default()),
        }
    }

    fn lookup(&self, day: i64) -> Option<(Vec<String>, String)> {
        let state = self.state.read();
        state
            .by_day
            .get(&day)
            .map(|group| (group.clone(), state.group_route_key.clone()))
    }

    fn put_day(&self, day: i64, group: Vec<String>) {
        let mut state = self.state.write();
        state.by_day.insert(day, group);
        if state.timeline.map_or(true, |t| day > t) {
            state.timeline = Some(day);
        }
    }
}

/// The route cache
pub struct RouteTable {
    routes: DashMap<String, Arc<RouteInfo>>,
    store: Arc<dyn MetaStore>,
    keys: Keys,
    config: RouteConfig,
}

impl RouteTable {
    pub fn new(store: Arc<dyn MetaStore>, keys: Keys, config: RouteConfig) -> Self {
        Self {
            routes: DashMap::new(),
            store,
            keys,
            config,
        }
    }

    fn route_info(&self, metric: &str) -> Arc<RouteInfo> {
        self.routes
            .entry(metric.to_string())
            .or_insert_with(|| Arc::new(RouteInfo::new()))
            .clone()
    }

    /// The shard group serving `metric` on `day`, plus the metric's
    /// shard-group route key.
    ///
    /// On a miss the store is consulted under the metric's fill lock; on
    /// a second miss a fresh group is allocated and written there.
    pub async fn get_shard_ids(&self, metric: &str, day: i64) -> Result<(Vec<String>, String)> {
        let route_info = self.route_info(metric);
        if let Some(found) = route_info.lookup(day) {
            return Ok(found);
        }

        let _guard = route_info.fill_lock.lock().await;
        if let Some(found) = route_info.lookup(day) {
            return Ok(found);
        }

        let (group, group_route_key) = self.fetch_or_allocate(metric, day).await?;
        {
            let mut state = route_info.state.write();
            state.group_route_key = group_route_key.clone();
        }
        route_info.put_day(day, group.clone());

        Ok((group, group_route_key))
    }

    async fn fetch_or_allocate(&self, metric: &str, day: i64) -> Result<(Vec<String>, String)> {
        info!(metric, day, "Route miss, consulting store");

        let group_route_key = self
            .store
            .get(&self.keys.sgroute_key(metric))
            .await?
            .unwrap_or_default();

        let route_key = self.keys.route_key(metric, day);
        if let Some(value) = self.store.get(&route_key).await? {
            let group: Vec<String> = serde_json::from_str(&value)?;
            return Ok((group, group_route_key));
        }

        let group = self.allocate(metric, day, &route_key).await?;
        Ok((group, group_route_key))
    }

    /// Allocate a shard group for a cold `(metric, day)`.
    ///
    /// Masters are read from the store's node keys and sorted by shard
    /// id, so independent gateways racing here compute the same group;
    /// the conditional put decides the winner and the loser adopts the
    /// stored value.
    async fn allocate(&self, metric: &str, day: i64, route_key: &str) -> Result<Vec<String>> {
        let mut masters = Vec::new();
        for (key, value) in self.store.get_prefix(&self.keys.node_prefix()).await? {
            match serde_json::from_str::<crate::cluster::Node>(&value) {
                Ok(node) if node.is_master() => masters.push(node.shard_id),
                Ok(_) => {}
                Err(e) => warn!(key, error = %e, "Skipping undecodable node key"),
            }
        }
        masters.sort();
        masters.dedup();

        if masters.len() < self.config.shard_group_cap {
            return Err(Error::Routing(format!(
                "{} masters available, {} needed to init {}",
                masters.len(),
                self.config.shard_group_cap,
                route_key,
            )));
        }
        masters.truncate(self.config.shard_group_cap);

        let lease = self.store.grant_lease(self.config.route_info_ttl).await?;
        let value = serde_json::to_string(&masters)?;
        if self
            .store
            .put_if_absent(route_key, &value, Some(lease))
            .await?
        {
            info!(metric, day, group = ?masters, "Allocated shard group");
            return Ok(masters);
        }

        // Another gateway won the allocation; adopt its group.
        let value = self
            .store
            .get(route_key)
            .await?
            .ok_or_else(|| Error::Routing(format!("Lost allocation race for {route_key} and the winner's entry vanished")))?;
        let group: Vec<String> = serde_json::from_str(&value)?;
        debug!(metric, day, group = ?group, "Adopted group allocated elsewhere");
        Ok(group)
    }

    /// Pick the shard for one sample: the day group indexed by a stable
    /// hash of the label set
    pub async fn shard_id_for(&self, labels: &Labels, day: i64, hash: u64) -> Result<String> {
        let metric = labels.metric_name().ok_or(Error::MissingMetricName)?;
        let (group, _) = self.get_shard_ids(metric, day).await?;
        if group.is_empty() {
            return Err(Error::Routing(format!("Empty shard group for {metric}/{day}")));
        }
        Ok(group[hash as usize % group.len()].clone())
    }

    /// Apply a route PUT observed by the watcher
    pub fn apply_route_put(&self, metric: &str, day: i64, group: Vec<String>) {
        self.route_info(metric).put_day(day, group);
    }

    /// Drop a day's route. Deleting the timeline day means the metric's
    /// lease window ended: the whole entry goes.
    pub fn invalidate(&self, metric: &str, day: i64) {
        let Some(route_info) = self.routes.get(metric).map(|r| Arc::clone(r.value())) else {
            return;
        };

        let evict_metric = {
            let mut state = route_info.state.write();
            state.by_day.remove(&day);
            state.timeline == Some(day)
        };

        if evict_metric {
            info!(metric, day, "Timeline day deleted, evicting metric route");
            self.routes.remove(metric);
        }
    }

    /// Update the metric's shard-group route key (empty on delete)
    pub fn set_group_route_key(&self, metric: &str, key: &str) {
        let route_info = self.route_info(metric);
        route_info.state.write().group_route_key = key.to_string();
    }

    /// Group route key currently cached for a metric
    pub fn group_route_key(&self, metric: &str) -> Option<String> {
        self.routes
            .get(metric)
            .map(|r| r.state.read().group_route_key.clone())
    }

    /// Whether a metric currently has any cached route
    pub fn contains(&self, metric: &str) -> bool {
        self.routes.contains_key(metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn master_json(shard_id: &str, port: u16) -> String {
        serde_json::json!({
            "shard_id": shard_id,
            "ip": "127.0.0.1",
            "port": port.to_string(),
            "master_ip": "",
            "master_port": "",
            "idc": "z1",
            "heartbeat_at": 0,
        })
        .to_string()
    }

    async fn table_with_masters(cap: usize, shard_ids: &[&str]) -> (MemoryStore, Arc<RouteTable>) {
        let store = MemoryStore::new();
        let keys = Keys::new("/test");
        for (i, id) in shard_ids.iter().enumerate() {
            let port = 9000 + i as u16;
            store
                .put(
                    &keys.node_key(&format!("127.0.0.1:{port}")),
                    &master_json(id, port),
                    None,
                )
                .await
                .unwrap();
        }

        let config = RouteConfig {
            shard_group_cap: cap,
            ..RouteConfig::default()
        };
        let table = Arc::new(RouteTable::new(Arc::new(store.clone()), keys, config));
        (store, table)
    }

    #[tokio::test]
    async fn test_allocation_takes_lowest_shard_ids() {
        let (_store, table) = table_with_masters(2, &["c", "a", "b"]).await;

        let (group, _) = table.get_shard_ids("cpu", 100).await.unwrap();
        assert_eq!(group, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_allocation_fails_with_too_few_masters() {
        let (_store, table) = table_with_masters(3, &["a", "b"]).await;

        let err = table.get_shard_ids("cpu", 100).await.unwrap_err();
        assert!(matches!(err, Error::Routing(_)));
    }

    #[tokio::test]
    async fn test_concurrent_cold_misses_issue_one_write() {
        let (store, table) = table_with_masters(2, &["a", "b", "c"]).await;
        let writes_before = store.put_count();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            handles.push(tokio::spawn(
                async move { table.get_shard_ids("cpu", 100).await },
            ));
        }

        let mut groups = Vec::new();
        for handle in handles {
            let (group, _) = handle.await.unwrap().unwrap();
            groups.push(group);
        }

        assert!(groups.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.put_count() - writes_before, 1);
    }

    #[tokio::test]
    async fn test_adopts_group_already_in_store() {
        let (store, table) = table_with_masters(2, &["a", "b"]).await;
        let keys = Keys::new("/test");
        store
            .put(&keys.route_key("cpu", 100), r#"["x","y"]"#, None)
            .await
            .unwrap();

        let (group, _) = table.get_shard_ids("cpu", 100).await.unwrap();
        assert_eq!(group, vec!["x".to_string(), "y".to_string()]);
    }

    #[tokio::test]
    async fn test_timeline_delete_evicts_whole_metric() {
        let (_store, table) = table_with_masters(2, &["a", "b"]).await;

        table.apply_route_put("cpu", 1, vec!["a".to_string()]);
        table.apply_route_put("cpu", 2, vec!["b".to_string()]);
        assert!(table.contains("cpu"));

        // Deleting an old day keeps the metric.
        table.invalidate("cpu", 1);
        assert!(table.contains("cpu"));

        // Deleting the timeline day evicts everything.
        table.invalidate("cpu", 2);
        assert!(!table.contains("cpu"));
    }

    #[tokio::test]
    async fn test_shard_id_for_spreads_by_hash() {
        let (_store, table) = table_with_masters(2, &["a", "b"]).await;

        let labels = Labels::from_pairs(vec![("__name__", "cpu"), ("host", "h1")]);
        let s0 = table.shard_id_for(&labels, 100, 0).await.unwrap();
        let s1 = table.shard_id_for(&labels, 100, 1).await.unwrap();
        assert_eq!(s0, "a");
        assert_eq!(s1, "b");
    }

    #[tokio::test]
    async fn test_group_route_key_tracks_store() {
        let (store, table) = table_with_masters(2, &["a", "b"]).await;
        let keys = Keys::new("/test");
        store
            .put(&keys.sgroute_key("cpu"), "policy-7", None)
            .await
            .unwrap();

        let (_, group_route_key) = table.get_shard_ids("cpu", 100).await.unwrap();
        assert_eq!(group_route_key, "policy-7");

        table.set_group_route_key("cpu", "");
        assert_eq!(table.group_route_key("cpu").as_deref(), Some(""));
    }
}
