//! Cluster membership and coordination
//!
//! The gateway keeps an immutable snapshot of every shard's master and
//! slaves, rebuilt from the consensus store's node keys. A watcher
//! applies membership deltas and node deaths feed the failover
//! coordinator.

mod failover;
mod view;
mod watcher;

pub use failover::FailoverCoordinator;
pub use view::ClusterView;
pub use watcher::MetaWatcher;

use crate::clock::now_millis;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One backend node as heartbeated into the consensus store.
///
/// A node is a master iff both `master_ip` and `master_port` are empty;
/// otherwise they point at the node it replicates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub shard_id: String,
    pub ip: String,
    pub port: String,
    #[serde(default)]
    pub master_ip: String,
    #[serde(default)]
    pub master_port: String,
    /// Opaque locality tag used by the failover tie-break
    #[serde(default)]
    pub idc: String,
    /// Millisecond timestamp of the last heartbeat
    #[serde(default)]
    pub heartbeat_at: i64,
}

impl Node {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn is_master(&self) -> bool {
        self.master_ip.is_empty() && self.master_port.is_empty()
    }

    /// Whether the node may still be alive: its last heartbeat is
    /// younger than the session TTL. A key deletion for a node that may
    /// be online is a transient blip, not a death.
    pub fn may_online(&self, session_expire_ttl: Duration) -> bool {
        now_millis() - self.heartbeat_at < session_expire_ttl.as_millis() as i64
    }
}

/// A shard's membership at one cluster-view snapshot.
///
/// Replaced wholesale on every rebuild, never mutated in place; the
/// failover latch therefore guards one view generation, which is enough
/// to stop redundant re-entry inside one process.
#[derive(Debug)]
pub struct Shard {
    pub id: String,
    pub master: Option<Node>,
    pub slaves: Vec<Node>,
    failovering: AtomicBool,
}

impl Shard {
    pub(crate) fn new(id: String, master: Option<Node>, slaves: Vec<Node>) -> Self {
        Self {
            id,
            master,
            slaves,
            failovering: AtomicBool::new(false),
        }
    }

    /// Flip the per-shard failover latch; `false` means a failover of
    /// this shard is already in flight in this process.
    pub(crate) fn begin_failover(&self) -> bool {
        self.failovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_failover(&self) {
        self.failovering.store(false, Ordering::SeqCst);
    }

    pub fn is_failovering(&self) -> bool {
        self.failovering.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(shard_id: &str, port: &str, master_port: &str) -> Node {
        Node {
            shard_id: shard_id.to_string(),
            ip: "10.0.0.1".to_string(),
            port: port.to_string(),
            master_ip: if master_port.is_empty() {
                String::new()
            } else {
                "10.0.0.1".to_string()
            },
            master_port: master_port.to_string(),
            idc: "z1".to_string(),
            heartbeat_at: 0,
        }
    }

    #[test]
    fn test_master_classification() {
        assert!(node("1", "8080", "").is_master());
        assert!(!node("1", "8081", "8080").is_master());
    }

    #[test]
    fn test_may_online_uses_heartbeat_age() {
        let mut n = node("1", "8080", "");
        n.heartbeat_at = now_millis();
        assert!(n.may_online(Duration::from_secs(30)));

        n.heartbeat_at = now_millis() - 60_000;
        assert!(!n.may_online(Duration::from_secs(30)));
    }

    #[test]
    fn test_failover_latch_is_once() {
        let shard = Shard::new("1".to_string(), None, Vec::new());
        assert!(shard.begin_failover());
        assert!(!shard.begin_failover());
        shard.end_failover();
        assert!(shard.begin_failover());
    }
}
