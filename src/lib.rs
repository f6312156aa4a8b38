//! # Baudtime gateway core
//!
//! Distributed coordination layer of a horizontally sharded time-series
//! database. The gateway maps samples and queries onto a dynamic set of
//! shards backed by master/slave node pairs, watches a consensus store
//! for membership changes, promotes a surviving slave when a master
//! dies, and merges query results streamed back from many shards in
//! label-sorted order.
//!
//! ## Architecture
//!
//! - **Store**: typed get/put/watch/lease/mutex primitives over the
//!   external consensus store
//! - **Route**: per-metric per-day shard-group cache, filled under a
//!   per-metric lock and kept fresh by watch events
//! - **Cluster**: atomically published shard snapshot, membership
//!   watcher, and master failover
//! - **Shard**: connection-pooled request/response to one shard
//! - **Query**: parallel fan-out with k-way label-ordered merging
//! - **Ingester**: per-shard batching write fan-out

pub mod clock;
pub mod cluster;
pub mod config;
pub mod gateway;
pub mod ingester;
pub mod query;
pub mod route;
pub mod schema;
pub mod shard;
pub mod store;

mod error;

pub use error::{Error, MultiError, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{ClusterView, FailoverCoordinator, MetaWatcher, Node, Shard};
    pub use crate::config::Config;
    pub use crate::gateway::Gateway;
    pub use crate::ingester::FanoutAppender;
    pub use crate::query::{FanoutQuerier, SelectParams, SeriesIterator, SeriesSet};
    pub use crate::route::RouteTable;
    pub use crate::schema::{Label, Labels, Matcher, MatchType, Point, Series};
    pub use crate::shard::ShardClient;
    pub use crate::store::{EtcdStore, MemoryStore, MetaStore};
    pub use crate::{Error, MultiError, Result};
}
