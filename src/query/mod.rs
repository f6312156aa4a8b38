//! Query fan-out
//!
//! Resolves matchers to the shard set responsible for the queried time
//! span, dispatches sub-queries in parallel, and reassembles the
//! label-ordered result through the merge layer. A query is not
//! partial-tolerant: any failing shard fails the whole query with the
//! accumulated multi-error.

mod merge;

pub use merge::{
    merge_string_slices, ListSeriesSet, MergeIterator, MergeSeriesSet, PointsIterator,
    SeriesIterator, SeriesSet,
};

use crate::clock::days_in_span;
use crate::cluster::ClusterView;
use crate::config::QueryConfig;
use crate::route::RouteTable;
use crate::schema::{metric_name_from_matchers, Matcher};
use crate::shard::{ConnectionPools, SelectRequest, ShardClient};
use crate::{Error, MultiError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

/// Per-query parameters beyond the matcher set
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectParams {
    /// Query resolution step in milliseconds
    pub step: i64,
}

/// A querier over the time span `[mint, maxt]`
pub struct FanoutQuerier {
    mint: i64,
    maxt: i64,
    view: Arc<ClusterView>,
    routes: Arc<RouteTable>,
    pools: Arc<ConnectionPools>,
    config: QueryConfig,
}

impl FanoutQuerier {
    pub fn new(
        mint: i64,
        maxt: i64,
        view: Arc<ClusterView>,
        routes: Arc<RouteTable>,
        pools: Arc<ConnectionPools>,
        config: QueryConfig,
    ) -> Self {
        Self {
            mint,
            maxt,
            view,
            routes,
            pools,
            config,
        }
    }

    /// Series matching the given matchers across every responsible
    /// shard, merged in label order
    pub async fn select(
        &self,
        params: SelectParams,
        matchers: &[Matcher],
    ) -> Result<Box<dyn SeriesSet>> {
        tokio::time::timeout(self.config.timeout, self.select_inner(params, matchers))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn select_inner(
        &self,
        params: SelectParams,
        matchers: &[Matcher],
    ) -> Result<Box<dyn SeriesSet>> {
        let metric = metric_name_from_matchers(matchers).ok_or(Error::MissingMetricName)?;

        // Union of each day's shard group, in seen-first order.
        let mut shard_ids = Vec::new();
        let mut seen = HashSet::new();
        for day in days_in_span(self.mint, self.maxt) {
            let (group, _) = self.routes.get_shard_ids(metric, day).await?;
            for shard_id in group {
                if seen.insert(shard_id.clone()) {
                    shard_ids.push(shard_id);
                }
            }
        }
        debug!(metric, shards = shard_ids.len(), "Fanning out select request");

        let request = SelectRequest {
            mint: self.mint,
            maxt: self.maxt,
            interval: params.step,
            matchers: matchers.to_vec(),
        };

        let mut join = JoinSet::new();
        let limit = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        for shard_id in shard_ids {
            let client = ShardClient::new(shard_id, self.view.clone(), self.pools.clone());
            let request = request.clone();
            let limit = limit.clone();
            join.spawn(async move {
                let _permit = limit
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Internal(format!("Concurrency limiter closed: {e}")))?;
                client.select(request).await
            });
        }

        let mut sets: Vec<Box<dyn SeriesSet>> = Vec::new();
        let mut multi = MultiError::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(Ok(series)) => sets.push(Box::new(ListSeriesSet::new(series))),
                Ok(Err(e)) => multi.push(e),
                Err(e) => multi.push(Error::Internal(format!("Sub-query task failed: {e}"))),
            }
        }
        multi.into_result()?;

        Ok(MergeSeriesSet::new(sets))
    }

    /// All values of one label name, gathered from every shard in the
    /// current cluster view.
    ///
    /// Label-value discovery is global: shards outside the route cache
    /// may still hold historical values, so the fan-out ignores routing
    /// and asks everyone.
    pub async fn label_values(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>> {
        tokio::time::timeout(self.config.timeout, self.label_values_inner(name, matchers))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn label_values_inner(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>> {
        let shard_ids = self.view.shard_ids();
        debug!(name, shards = shard_ids.len(), "Fanning out label values request");

        let mut join = JoinSet::new();
        let limit = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        for shard_id in shard_ids {
            let client = ShardClient::new(shard_id, self.view.clone(), self.pools.clone());
            let name = name.to_string();
            let matchers = matchers.to_vec();
            let limit = limit.clone();
            join.spawn(async move {
                let _permit = limit
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Internal(format!("Concurrency limiter closed: {e}")))?;
                client.label_values(&name, &matchers).await
            });
        }

        let mut results = Vec::new();
        let mut multi = MultiError::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(Ok(values)) => results.push(values),
                Ok(Err(e)) => multi.push(e),
                Err(e) => multi.push(Error::Internal(format!("Sub-query task failed: {e}"))),
            }
        }
        multi.into_result()?;

        Ok(merge_string_slices(results))
    }
}
