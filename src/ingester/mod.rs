//! Write fan-out
//!
//! Each incoming sample is routed to the shard its label-set hash lands
//! on for the sample's day, then buffered in a per-shard batch. Batches
//! flush when they reach the configured size or age. A flush failure on
//! one shard never aborts the others; errors accumulate into a
//! multi-error.

use crate::clock::day_of;
use crate::cluster::ClusterView;
use crate::config::AppendConfig;
use crate::route::RouteTable;
use crate::schema::{Labels, Point, Series};
use crate::shard::{ConnectionPools, ShardClient};
use crate::{MultiError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Batching appender for one shard
struct ShardAppender {
    client: ShardClient,
    buffer: Vec<Series>,
    last_flush: Instant,
    config: AppendConfig,
}

impl ShardAppender {
    fn new(client: ShardClient, config: AppendConfig) -> Self {
        Self {
            client,
            buffer: Vec::with_capacity(config.batch_size),
            last_flush: Instant::now(),
            config,
        }
    }

    async fn add(&mut self, labels: Labels, t: i64, v: f64) -> Result<()> {
        self.buffer.push(Series {
            labels,
            points: vec![Point::new(t, v)],
        });

        if self.buffer.len() >= self.config.batch_size
            || self.last_flush.elapsed() >= self.config.flush_interval
        {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.last_flush = Instant::now();
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.buffer);
        debug!(
            shard_id = %self.client.shard_id(),
            series = batch.len(),
            "Flushing batch"
        );
        self.client.add(batch).await
    }
}

/// Routes samples onto per-shard batching appenders.
///
/// One appender serves one ingest stream; hand out a fresh one per
/// request the way queriers are handed out.
pub struct FanoutAppender {
    appenders: HashMap<String, ShardAppender>,
    routes: Arc<RouteTable>,
    view: Arc<ClusterView>,
    pools: Arc<ConnectionPools>,
    config: AppendConfig,
}

impl FanoutAppender {
    pub fn new(
        routes: Arc<RouteTable>,
        view: Arc<ClusterView>,
        pools: Arc<ConnectionPools>,
        config: AppendConfig,
    ) -> Self {
        Self {
            appenders: HashMap::new(),
            routes,
            view,
            pools,
            config,
        }
    }

    /// Buffer one sample toward its shard.
    ///
    /// `hash` is the caller-computed stable hash of the label set
    /// ([`Labels::hash_value`]); it decides which member of the day's
    /// shard group receives the sample.
    pub async fn add(&mut self, labels: Labels, t: i64, v: f64, hash: u64) -> Result<()> {
        let shard_id = self.routes.shard_id_for(&labels, day_of(t), hash).await?;

        let appender = match self.appenders.entry(shard_id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let client =
                    ShardClient::new(entry.key().clone(), self.view.clone(), self.pools.clone());
                entry.insert(ShardAppender::new(client, self.config.clone()))
            }
        };

        appender.add(labels, t, v).await
    }

    /// Flush every per-shard batch in parallel, accumulating failures
    /// instead of aborting the siblings
    pub async fn flush(&mut self) -> Result<()> {
        let flushes: Vec<_> = self
            .appenders
            .values_mut()
            .map(|appender| appender.flush())
            .collect();

        let mut multi = MultiError::new();
        for result in futures::future::join_all(flushes).await {
            if let Err(e) = result {
                multi.push(e);
            }
        }
        multi.into_result()
    }

    /// Number of shards with an open batch, for observability
    pub fn active_shards(&self) -> usize {
        self.appenders.len()
    }
}
