//! Shard client
//!
//! Connection-pooled request/response to a single shard. Writes always
//! target the shard's master; reads prefer the master and fall back to
//! a slave when the master seat is empty. The client never retries
//! across master changes; after a failure the fan-out re-resolves the
//! shard on its next request.

mod conn;
mod message;
mod pool;

pub use conn::Connection;
pub use message::{
    AddRequest, GeneralResponse, LabelValuesRequest, LabelValuesResponse, Request, Response,
    SelectRequest, SelectResponse, SlaveOfCommand, StatusCode,
};
pub use pool::{ConnectionPool, ConnectionPools, PooledConnection};

use crate::cluster::ClusterView;
use crate::schema::{Matcher, Series};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::debug;

pub struct ShardClient {
    shard_id: String,
    view: Arc<ClusterView>,
    pools: Arc<ConnectionPools>,
}

impl ShardClient {
    pub fn new(shard_id: impl Into<String>, view: Arc<ClusterView>, pools: Arc<ConnectionPools>) -> Self {
        Self {
            shard_id: shard_id.into(),
            view,
            pools,
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Read series matching the given matchers in `[mint, maxt]`
    pub async fn select(&self, request: SelectRequest) -> Result<Vec<Series>> {
        let addr = self.read_addr()?;
        let response = self.exchange(&addr, &Request::Select(request)).await?;
        match response {
            Response::Select(resp) if resp.status == StatusCode::Succeed => Ok(resp.series),
            Response::Select(resp) => Err(Error::ShardFailed {
                shard_id: self.shard_id.clone(),
                message: resp.error_msg,
            }),
            _ => Err(self.unexpected_reply()),
        }
    }

    /// All values of one label name on this shard
    pub async fn label_values(&self, name: &str, matchers: &[Matcher]) -> Result<Vec<String>> {
        let addr = self.read_addr()?;
        let request = Request::LabelValues(LabelValuesRequest {
            name: name.to_string(),
            matchers: matchers.to_vec(),
        });
        let response = self.exchange(&addr, &request).await?;
        match response {
            Response::LabelValues(resp) if resp.status == StatusCode::Succeed => Ok(resp.values),
            Response::LabelValues(resp) => Err(Error::ShardFailed {
                shard_id: self.shard_id.clone(),
                message: resp.error_msg,
            }),
            _ => Err(self.unexpected_reply()),
        }
    }

    /// Append a batch of samples to the shard master
    pub async fn add(&self, series: Vec<Series>) -> Result<()> {
        let addr = self.master_addr()?;
        let response = self
            .exchange(&addr, &Request::Add(AddRequest { series }))
            .await?;
        match response {
            Response::General(resp) if resp.status == StatusCode::Succeed => Ok(()),
            Response::General(resp) => Err(Error::ShardFailed {
                shard_id: self.shard_id.clone(),
                message: resp.message,
            }),
            _ => Err(self.unexpected_reply()),
        }
    }

    fn master_addr(&self) -> Result<String> {
        self.view
            .master(&self.shard_id)
            .map(|m| m.addr())
            .ok_or_else(|| Error::ShardUnreachable {
                shard_id: self.shard_id.clone(),
                reason: "Shard has no master".to_string(),
            })
    }

    fn read_addr(&self) -> Result<String> {
        if let Some(master) = self.view.master(&self.shard_id) {
            return Ok(master.addr());
        }
        self.view
            .slaves(&self.shard_id)
            .first()
            .map(|s| s.addr())
            .ok_or_else(|| Error::ShardUnreachable {
                shard_id: self.shard_id.clone(),
                reason: "Shard has no readable node".to_string(),
            })
    }

    async fn exchange(&self, addr: &str, request: &Request) -> Result<Response> {
        let pool = self.pools.get(addr);
        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(Error::Io(e)) => {
                return Err(Error::ShardUnreachable {
                    shard_id: self.shard_id.clone(),
                    reason: e.to_string(),
                })
            }
            Err(Error::Timeout) => {
                return Err(Error::ShardUnreachable {
                    shard_id: self.shard_id.clone(),
                    reason: "Dial timed out".to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        match conn.request(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // The stream may hold a half-read frame; never re-pool it.
                conn.discard();
                debug!(shard_id = %self.shard_id, addr, error = %e, "Shard exchange failed");
                Err(match e {
                    Error::Io(io) => Error::ShardUnreachable {
                        shard_id: self.shard_id.clone(),
                        reason: io.to_string(),
                    },
                    Error::Timeout => Error::ShardUnreachable {
                        shard_id: self.shard_id.clone(),
                        reason: "Request timed out".to_string(),
                    },
                    other => other,
                })
            }
        }
    }

    fn unexpected_reply(&self) -> Error {
        Error::ShardFailed {
            shard_id: self.shard_id.clone(),
            message: "Unexpected reply type".to_string(),
        }
    }
}
