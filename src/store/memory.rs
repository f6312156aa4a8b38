//! In-process consensus store
//!
//! A single-process [`MetaStore`] with working leases, watches, and
//! named mutexes. It backs the test suites the way a real store would
//! and doubles as the store for single-node development clusters.

use super::{EventKind, LeaseId, MetaStore, WatchEvent};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct WatcherReg {
    prefix: String,
    with_prev: bool,
    tx: mpsc::Sender<WatchEvent>,
}

struct Inner {
    data: Mutex<BTreeMap<String, Entry>>,
    leases: Mutex<HashMap<LeaseId, Instant>>,
    watchers: Mutex<Vec<WatcherReg>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    held: Mutex<HashMap<String, tokio::sync::OwnedMutexGuard<()>>>,
    next_lease: AtomicI64,
    next_lock: AtomicU64,
    put_count: AtomicUsize,
}

impl Inner {
    fn notify(&self, kind: EventKind, key: &str, value: &str, prev_value: Option<String>) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            let event = WatchEvent {
                kind,
                key: key.to_string(),
                value: value.to_string(),
                prev_value: if w.with_prev { prev_value.clone() } else { None },
            };
            w.tx.try_send(event).is_ok() || !w.tx.is_closed()
        });
    }

    fn expire_leases(&self, now: Instant) {
        let expired: Vec<LeaseId> = {
            let mut leases = self.leases.lock();
            let expired = leases
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            for id in &expired {
                leases.remove(id);
            }
            expired
        };
        if expired.is_empty() {
            return;
        }

        let removed: Vec<(String, Entry)> = {
            let mut data = self.data.lock();
            let keys: Vec<String> = data
                .iter()
                .filter(|(_, e)| e.lease.map(|l| expired.contains(&l)).unwrap_or(false))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| data.remove(&k).map(|e| (k, e)))
                .collect()
        };

        for (key, entry) in removed {
            self.notify(EventKind::Delete, &key, "", Some(entry.value));
        }
    }
}

/// In-process [`MetaStore`]
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create a store and start its lease-expiry sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            data: Mutex::new(BTreeMap::new()),
            leases: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            locks: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            next_lease: AtomicI64::new(1),
            next_lock: AtomicU64::new(1),
            put_count: AtomicUsize::new(0),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(25));
            loop {
                tick.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.expire_leases(Instant::now()),
                    None => return,
                }
            }
        });

        Self { inner }
    }

    /// Number of writes issued so far, for assertions on write dedup
    pub fn put_count(&self) -> usize {
        self.inner.put_count.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.data.lock().get(key).map(|e| e.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .inner
            .data
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        self.inner.put_count.fetch_add(1, Ordering::SeqCst);
        let prev = {
            let mut data = self.inner.data.lock();
            data.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    lease,
                },
            )
        };
        self.inner
            .notify(EventKind::Put, key, value, prev.map(|e| e.value));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<bool> {
        let created = {
            let mut data = self.inner.data.lock();
            if data.contains_key(key) {
                false
            } else {
                self.inner.put_count.fetch_add(1, Ordering::SeqCst);
                data.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        lease,
                    },
                );
                true
            }
        };
        if created {
            self.inner.notify(EventKind::Put, key, value, None);
        }
        Ok(created)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let prev = self.inner.data.lock().remove(key);
        if let Some(entry) = prev {
            self.inner
                .notify(EventKind::Delete, key, "", Some(entry.value));
        }
        Ok(())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let id = self.inner.next_lease.fetch_add(1, Ordering::SeqCst);
        self.inner.leases.lock().insert(id, Instant::now() + ttl);
        Ok(id)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        with_prev: bool,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(1024);
        self.inner.watchers.lock().push(WatcherReg {
            prefix: prefix.to_string(),
            with_prev,
            tx,
        });
        Ok(rx)
    }

    async fn lock(&self, name: &str) -> Result<Vec<u8>> {
        let mutex = {
            let mut locks = self.inner.locks.lock();
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        let token = format!(
            "{}/{}",
            name,
            self.inner.next_lock.fetch_add(1, Ordering::SeqCst)
        );
        self.inner.held.lock().insert(token.clone(), guard);
        Ok(token.into_bytes())
    }

    async fn unlock(&self, key: Vec<u8>) -> Result<()> {
        let token = String::from_utf8_lossy(&key).to_string();
        self.inner.held.lock().remove(&token);
        Ok(())
    }
}
