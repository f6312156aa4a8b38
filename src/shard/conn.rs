//! Framed connection to one shard backend
//!
//! Requests and responses travel as length-delimited JSON frames over
//! TCP. One connection serves one request/response exchange at a time;
//! concurrency comes from the pool, not from pipelining.

use super::message::{Request, Response};
use crate::config::ClientConfig;
use crate::{Error, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    rw_timeout: Duration,
    peer: String,
}

impl Connection {
    /// Dial a shard backend, bounded by the configured dial timeout
    pub async fn connect(addr: &str, config: &ClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true)?;

        Ok(Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            rw_timeout: config.rw_timeout,
            peer: addr.to_string(),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one request frame
    pub async fn send(&mut self, request: &Request) -> Result<()> {
        let bytes = serde_json::to_vec(request)?;
        tokio::time::timeout(self.rw_timeout, self.framed.send(Bytes::from(bytes)))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(())
    }

    /// Read one response frame, waiting indefinitely.
    ///
    /// Callers that need a bounded wait (the failover reply) wrap this
    /// in their own timeout; the pooled request path uses
    /// [`Connection::request`] instead.
    pub async fn recv(&mut self) -> Result<Response> {
        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "Connection closed")))??;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// One request/response exchange with the read bounded by the
    /// configured rw timeout
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        self.send(request).await?;
        tokio::time::timeout(self.rw_timeout, self.recv())
            .await
            .map_err(|_| Error::Timeout)?
    }
}
