//! Per-backend connection pooling
//!
//! Each backend address gets a fixed-size pool of framed connections.
//! Acquiring blocks when the pool is exhausted; a released healthy
//! connection goes back to the idle queue, a broken one is discarded so
//! the next acquire dials a fresh replacement.

use super::conn::Connection;
use crate::config::ClientConfig;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed-size pool of connections to one backend address
pub struct ConnectionPool {
    addr: String,
    config: ClientConfig,
    semaphore: Arc<Semaphore>,
    idle: Arc<Mutex<VecDeque<Connection>>>,
}

impl ConnectionPool {
    pub fn new(addr: impl Into<String>, config: ClientConfig) -> Self {
        let capacity = config.conn_num_per_backend.max(1);
        Self {
            addr: addr.into(),
            config,
            semaphore: Arc::new(Semaphore::new(capacity)),
            idle: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    /// Acquire a connection, dialing a new one when the idle queue is
    /// empty. Blocks while all connections are in use.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Pool(format!("Pool for {} is closed", self.addr)))?;

        let idle = self.idle.lock().pop_front();
        let conn = match idle {
            Some(conn) => conn,
            None => Connection::connect(&self.addr, &self.config).await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            idle: self.idle.clone(),
            _permit: permit,
        })
    }
}

/// A pool loan. Dropping it returns the connection to the idle queue;
/// [`PooledConnection::discard`] drops the connection instead, which is
/// what error paths do so a poisoned stream is never reused.
pub struct PooledConnection {
    conn: Option<Connection>,
    idle: Arc<Mutex<VecDeque<Connection>>>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn discard(mut self) {
        self.conn = None;
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already discarded")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already discarded")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.idle.lock().push_back(conn);
        }
    }
}

/// Registry of one [`ConnectionPool`] per backend address, shared by
/// every querier and appender of a gateway
pub struct ConnectionPools {
    pools: DashMap<String, Arc<ConnectionPool>>,
    config: ClientConfig,
}

impl ConnectionPools {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            pools: DashMap::new(),
            config,
        }
    }

    pub fn get(&self, addr: &str) -> Arc<ConnectionPool> {
        self.pools
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(ConnectionPool::new(addr, self.config.clone())))
            .clone()
    }
}
