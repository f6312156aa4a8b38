//! Configuration for the gateway coordination core
//!
//! Every component takes a small plain config struct with defaults that
//! work for a single-node development cluster. The aggregate [`Config`]
//! is what `Gateway::connect` consumes.

use std::time::Duration;

/// Aggregate configuration for the gateway
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Consensus store client configuration
    pub store: StoreConfig,
    /// Routing configuration
    pub route: RouteConfig,
    /// Shard client configuration
    pub client: ClientConfig,
    /// Query fan-out configuration
    pub query: QueryConfig,
    /// Appender batching configuration
    pub append: AppendConfig,
    /// Node liveness and failover configuration
    pub failover: FailoverConfig,
}

/// Consensus store client configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store endpoints
    pub endpoints: Vec<String>,
    /// Key namespace prefix shared by all gateways of one cluster
    pub namespace: String,
    /// Dial timeout for establishing the store connection
    pub dial_timeout: Duration,
    /// Per-request read/write timeout
    pub rw_timeout: Duration,
    /// Number of retries for transient store failures
    pub retry_num: usize,
    /// Delay between retries
    pub retry_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            namespace: "/baudtime".to_string(),
            dial_timeout: Duration::from_secs(5),
            rw_timeout: Duration::from_secs(3),
            retry_num: 3,
            retry_interval: Duration::from_millis(200),
        }
    }
}

/// Routing configuration
#[derive(Debug, Clone)]
pub struct RouteConfig {
    /// Number of shards serving one metric on one day
    pub shard_group_cap: usize,
    /// Lease duration for per-day route entries; expiry evicts the route
    pub route_info_ttl: Duration,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            shard_group_cap: 2,
            route_info_ttl: Duration::from_secs(2 * 86_400),
        }
    }
}

/// Shard client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Fixed number of pooled connections per shard backend
    pub conn_num_per_backend: usize,
    /// Dial timeout for shard connections
    pub dial_timeout: Duration,
    /// Read/write timeout for one request/response exchange
    pub rw_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            conn_num_per_backend: 4,
            dial_timeout: Duration::from_secs(3),
            rw_timeout: Duration::from_secs(10),
        }
    }
}

/// Query fan-out configuration
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Maximum number of shard sub-queries in flight per query
    pub concurrency: usize,
    /// Overall deadline for one fan-out query
    pub timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Appender batching configuration
#[derive(Debug, Clone)]
pub struct AppendConfig {
    /// Flush a per-shard batch once it holds this many samples
    pub batch_size: usize,
    /// Flush a per-shard batch after this long regardless of size
    pub flush_interval: Duration,
}

impl Default for AppendConfig {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Node liveness and failover configuration
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Interval at which nodes heartbeat their store key
    pub heartbeat_interval: Duration,
    /// Session TTL after which a silent node is considered dead
    pub session_expire_ttl: Duration,
    /// Bounded wait for the promotion reply from the chosen slave
    pub reply_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            session_expire_ttl: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(15),
        }
    }
}
