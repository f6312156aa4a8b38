//! etcd-backed consensus store client

use super::{EventKind, LeaseId, MetaStore, WatchEvent};
use crate::config::StoreConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, LockOptions, PutOptions,
    Txn, TxnOp, WatchOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// [`MetaStore`] implementation over an etcd cluster.
///
/// Transient request failures are retried `retry_num` times with
/// `retry_interval` between attempts; request timeouts are enforced by
/// the client's connect options.
pub struct EtcdStore {
    client: Client,
    retry_num: usize,
    retry_interval: Duration,
}

impl EtcdStore {
    /// Connect to the etcd endpoints named in the config
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout)
            .with_timeout(config.rw_timeout);

        let client = Client::connect(&config.endpoints, Some(options)).await?;
        debug!(endpoints = ?config.endpoints, "Connected to etcd");

        Ok(Self {
            client,
            retry_num: config.retry_num,
            retry_interval: config.retry_interval,
        })
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.retry_num => {
                    attempt += 1;
                    warn!(error = %e, attempt, "Store request failed, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => return Err(Error::Store(e)),
            }
        }
    }
}

#[async_trait]
impl MetaStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let resp = self
            .with_retry(|| {
                let mut kv = self.client.kv_client();
                let key = key.to_string();
                async move { kv.get(key, None).await }
            })
            .await?;

        match resp.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str().map_err(Error::Store)?.to_string())),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let resp = self
            .with_retry(|| {
                let mut kv = self.client.kv_client();
                let prefix = prefix.to_string();
                async move { kv.get(prefix, Some(GetOptions::new().with_prefix())).await }
            })
            .await?;

        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            pairs.push((
                kv.key_str().map_err(Error::Store)?.to_string(),
                kv.value_str().map_err(Error::Store)?.to_string(),
            ));
        }
        Ok(pairs)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        self.with_retry(|| {
            let mut kv = self.client.kv_client();
            let key = key.to_string();
            let value = value.to_string();
            let options = lease.map(|id| PutOptions::new().with_lease(id));
            async move { kv.put(key, value, options).await }
        })
        .await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<bool> {
        let resp = self
            .with_retry(|| {
                let mut kv = self.client.kv_client();
                let options = lease.map(|id| PutOptions::new().with_lease(id));
                let txn = Txn::new()
                    .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
                    .and_then(vec![TxnOp::put(key, value, options)]);
                async move { kv.txn(txn).await }
            })
            .await?;
        Ok(resp.succeeded())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_retry(|| {
            let mut kv = self.client.kv_client();
            let key = key.to_string();
            async move { kv.delete(key, None).await }
        })
        .await?;
        Ok(())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let resp = self
            .with_retry(|| {
                let mut lease = self.client.lease_client();
                async move { lease.grant(ttl_secs, None).await }
            })
            .await?;
        Ok(resp.id())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        with_prev: bool,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        let mut options = WatchOptions::new().with_prefix();
        if with_prev {
            options = options.with_prev_key();
        }

        let mut watch_client = self.client.watch_client();
        let (_watcher, mut stream) = watch_client
            .watch(prefix, Some(options))
            .await
            .map_err(Error::Store)?;

        let (tx, rx) = mpsc::channel(1024);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the stream;
            // dropping it cancels the watch on the server.
            let _watcher = _watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let (Ok(key), Ok(value)) = (kv.key_str(), kv.value_str()) else {
                                continue;
                            };
                            let watch_event = WatchEvent {
                                kind: match event.event_type() {
                                    EventType::Put => EventKind::Put,
                                    EventType::Delete => EventKind::Delete,
                                },
                                key: key.to_string(),
                                value: value.to_string(),
                                prev_value: event
                                    .prev_kv()
                                    .and_then(|kv| kv.value_str().ok())
                                    .map(str::to_string),
                            };
                            if tx.send(watch_event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!(prefix, "Watch stream closed by store");
                        return;
                    }
                    Err(e) => {
                        warn!(prefix, error = %e, "Watch stream failed");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn lock(&self, name: &str) -> Result<Vec<u8>> {
        // A session lease bounds how long a crashed holder can keep the
        // mutex; the lock key vanishes with the lease.
        let lease = self.grant_lease(Duration::from_secs(30)).await?;
        let mut lock_client = self.client.lock_client();
        let resp = lock_client
            .lock(name, Some(LockOptions::new().with_lease(lease)))
            .await
            .map_err(Error::Store)?;
        Ok(resp.key().to_vec())
    }

    async fn unlock(&self, key: Vec<u8>) -> Result<()> {
        let mut lock_client = self.client.lock_client();
        lock_client.unlock(key).await.map_err(Error::Store)?;
        Ok(())
    }
}
