//! Error types for the gateway coordination core

use std::fmt;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the gateway coordination core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key absent in the consensus store (internal signal, not surfaced to callers)
    #[error("Key not found")]
    KeyNotFound,
    /// Consensus store errors
    #[error("Store error: {0}")]
    Store(#[from] etcd_client::Error),
    /// Routing failed (e.g. fewer masters than the shard group capacity)
    #[error("Routing failed: {0}")]
    Routing(String),
    /// Query has no equality matcher on the metric name
    #[error("Missing metric name")]
    MissingMetricName,
    /// Connection or RPC to a shard failed
    #[error("Shard {shard_id} unreachable: {reason}")]
    ShardUnreachable { shard_id: String, reason: String },
    /// Shard responded with a non-Succeed status
    #[error("Shard {shard_id} failed: {message}")]
    ShardFailed { shard_id: String, message: String },
    /// Failover found no surviving slave to promote
    #[error("No available slave to fail over shard {0}")]
    NoAvailableSlave(String),
    /// Operation deadline exceeded
    #[error("Operation timed out")]
    Timeout,
    /// Connection pool errors
    #[error("Pool error: {0}")]
    Pool(String),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
    /// Collection of errors from parallel fan-out
    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Accumulator for errors gathered from parallel operations.
///
/// Fan-out queries and appender flushes run per-shard work concurrently;
/// each failure is collected here instead of aborting the siblings.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Collapse into a `Result`: `Ok` when nothing was collected.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
