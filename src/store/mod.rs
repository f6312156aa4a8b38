//! Consensus store client
//!
//! Everything the gateway knows about the cluster lives in an external
//! consensus store: per-day route entries, shard-group route keys, and
//! heartbeated node keys. This module isolates the rest of the core
//! from the particular store behind the [`MetaStore`] trait; higher
//! layers consume only this interface.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lease identifier handed back by [`MetaStore::grant_lease`]
pub type LeaseId = i64;

/// Kind of a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One change observed on a watched prefix.
///
/// `prev_value` is populated only on DELETE events of watches opened
/// with `with_prev`, which is how the watcher recovers the identity of
/// a dead node from its vanished key.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: String,
    pub prev_value: Option<String>,
}

/// Typed get/put/watch/lease/mutex primitives over the consensus store
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Read a single key, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read all keys under a prefix as `(key, value)` pairs
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Write a key, optionally bound to a lease
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Write a key only if it does not exist yet.
    ///
    /// Returns `true` when this caller created the key. Allocation races
    /// between gateways resolve here: the loser re-reads and adopts the
    /// winner's value.
    async fn put_if_absent(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<bool>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Grant a lease; keys bound to it disappear when it expires
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Subscribe to changes under a prefix.
    ///
    /// The stream closes when the underlying watch is lost; the caller
    /// must re-subscribe and run a full refresh before trusting deltas
    /// again.
    async fn watch_prefix(
        &self,
        prefix: &str,
        with_prev: bool,
    ) -> Result<mpsc::Receiver<WatchEvent>>;

    /// Acquire the named global mutex, blocking until held.
    ///
    /// Returns an opaque ownership key to pass to [`MetaStore::unlock`].
    async fn lock(&self, name: &str) -> Result<Vec<u8>>;

    /// Release a mutex acquired with [`MetaStore::lock`]
    async fn unlock(&self, key: Vec<u8>) -> Result<()>;
}

/// Key layout under the cluster namespace
#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        let mut namespace = namespace.into();
        while namespace.ends_with('/') {
            namespace.pop();
        }
        Self { namespace }
    }

    /// Prefix of per-metric per-day route entries
    pub fn route_prefix(&self) -> String {
        format!("{}/route/", self.namespace)
    }

    /// Route entry for one metric on one day
    pub fn route_key(&self, metric: &str, day: i64) -> String {
        format!("{}{}/{}", self.route_prefix(), metric, day)
    }

    /// Parse `{ns}/route/{metric}/{day}` back into `(metric, day)`
    pub fn parse_route_key(&self, key: &str) -> Option<(String, i64)> {
        let rest = key.strip_prefix(&self.route_prefix())?;
        let (metric, day) = rest.rsplit_once('/')?;
        let day = day.parse().ok()?;
        Some((metric.to_string(), day))
    }

    /// Prefix of shard-group route keys
    pub fn sgroute_prefix(&self) -> String {
        format!("{}/sgroute/", self.namespace)
    }

    /// Shard-group route key for one metric
    pub fn sgroute_key(&self, metric: &str) -> String {
        format!("{}{}", self.sgroute_prefix(), metric)
    }

    /// Parse `{ns}/sgroute/{metric}` back into the metric name
    pub fn parse_sgroute_key(&self, key: &str) -> Option<String> {
        key.strip_prefix(&self.sgroute_prefix()).map(str::to_string)
    }

    /// Prefix of heartbeated node keys
    pub fn node_prefix(&self) -> String {
        format!("{}/node/", self.namespace)
    }

    /// Node key for one backend address
    pub fn node_key(&self, addr: &str) -> String {
        format!("{}{}", self.node_prefix(), addr)
    }

    /// Name of a global mutex
    pub fn mutex_name(&self, name: &str) -> String {
        format!("{}/mutex/{}", self.namespace, name)
    }
}
