//! Shared fixtures: an in-process fake shard backend speaking the real
//! framed protocol, plus store-seeding helpers.

#![allow(dead_code)]

use baudtime::clock::now_millis;
use baudtime::cluster::Node;
use baudtime::schema::{Matcher, Series};
use baudtime::shard::{
    GeneralResponse, LabelValuesResponse, Request, Response, SelectResponse, StatusCode,
};
use baudtime::store::{Keys, MemoryStore, MetaStore};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// A minimal shard backend: stores appended series in memory, answers
/// selects and label-value queries, and counts promotion commands.
pub struct FakeShard {
    pub addr: String,
    storage: Arc<Mutex<Vec<Series>>>,
    slaveof_commands: Arc<AtomicUsize>,
    slaveof_reply: Arc<Mutex<GeneralResponse>>,
    slaveof_delay: Arc<Mutex<std::time::Duration>>,
}

impl FakeShard {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let storage: Arc<Mutex<Vec<Series>>> = Arc::new(Mutex::new(Vec::new()));
        let slaveof_commands = Arc::new(AtomicUsize::new(0));
        let slaveof_reply = Arc::new(Mutex::new(GeneralResponse::succeed()));
        let slaveof_delay = Arc::new(Mutex::new(std::time::Duration::ZERO));

        let shard = Self {
            addr,
            storage: storage.clone(),
            slaveof_commands: slaveof_commands.clone(),
            slaveof_reply: slaveof_reply.clone(),
            slaveof_delay: slaveof_delay.clone(),
        };

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let storage = storage.clone();
                let slaveof_commands = slaveof_commands.clone();
                let slaveof_reply = slaveof_reply.clone();
                let slaveof_delay = slaveof_delay.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                    while let Some(Ok(frame)) = framed.next().await {
                        let Ok(request) = serde_json::from_slice::<Request>(&frame) else {
                            return;
                        };
                        if matches!(request, Request::SlaveOf(_)) {
                            let delay = *slaveof_delay.lock();
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        let response = handle(
                            request,
                            &storage,
                            &slaveof_commands,
                            &slaveof_reply,
                        );
                        let bytes = serde_json::to_vec(&response).unwrap();
                        if framed.send(Bytes::from(bytes)).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        shard
    }

    /// Seed series directly, bypassing the wire
    pub fn preload(&self, series: Vec<Series>) {
        self.storage.lock().extend(series);
    }

    pub fn stored_series(&self) -> usize {
        self.storage.lock().len()
    }

    pub fn slaveof_commands(&self) -> usize {
        self.slaveof_commands.load(Ordering::SeqCst)
    }

    pub fn reply_slaveof_with(&self, reply: GeneralResponse) {
        *self.slaveof_reply.lock() = reply;
    }

    pub fn delay_slaveof_replies(&self, delay: std::time::Duration) {
        *self.slaveof_delay.lock() = delay;
    }
}

fn handle(
    request: Request,
    storage: &Mutex<Vec<Series>>,
    slaveof_commands: &AtomicUsize,
    slaveof_reply: &Mutex<GeneralResponse>,
) -> Response {
    match request {
        Request::Add(add) => {
            storage.lock().extend(add.series);
            Response::General(GeneralResponse::succeed())
        }
        Request::Select(select) => {
            let stored = storage.lock();
            let mut merged: Vec<Series> = Vec::new();
            for series in stored.iter() {
                if !matches(&select.matchers, series) {
                    continue;
                }
                let points: Vec<_> = series
                    .points
                    .iter()
                    .copied()
                    .filter(|p| p.t >= select.mint && p.t <= select.maxt)
                    .collect();
                if points.is_empty() {
                    continue;
                }
                match merged.iter_mut().find(|s| s.labels == series.labels) {
                    Some(existing) => existing.points.extend(points),
                    None => merged.push(Series {
                        labels: series.labels.clone(),
                        points,
                    }),
                }
            }
            for series in &mut merged {
                series.points.sort_by_key(|p| p.t);
            }
            merged.sort_by(|a, b| a.labels.cmp(&b.labels));
            Response::Select(SelectResponse {
                status: StatusCode::Succeed,
                series: merged,
                error_msg: String::new(),
            })
        }
        Request::LabelValues(req) => {
            let stored = storage.lock();
            let values: BTreeSet<String> = stored
                .iter()
                .filter(|s| matches(&req.matchers, s))
                .filter_map(|s| s.labels.get(&req.name).map(str::to_string))
                .collect();
            Response::LabelValues(LabelValuesResponse {
                status: StatusCode::Succeed,
                values: values.into_iter().collect(),
                error_msg: String::new(),
            })
        }
        Request::SlaveOf(_) => {
            slaveof_commands.fetch_add(1, Ordering::SeqCst);
            Response::General(slaveof_reply.lock().clone())
        }
    }
}

fn matches(matchers: &[Matcher], series: &Series) -> bool {
    matchers
        .iter()
        .all(|m| m.matches(series.labels.get(&m.name).unwrap_or("")))
}

fn node(shard_id: &str, addr: &str, master_addr: &str, idc: &str, heartbeat_at: i64) -> Node {
    let (ip, port) = addr.rsplit_once(':').unwrap();
    let (master_ip, master_port) = if master_addr.is_empty() {
        (String::new(), String::new())
    } else {
        let (ip, port) = master_addr.rsplit_once(':').unwrap();
        (ip.to_string(), port.to_string())
    };
    Node {
        shard_id: shard_id.to_string(),
        ip: ip.to_string(),
        port: port.to_string(),
        master_ip,
        master_port,
        idc: idc.to_string(),
        heartbeat_at,
    }
}

/// A master heartbeating right now
pub fn master_node(shard_id: &str, addr: &str, idc: &str) -> Node {
    node(shard_id, addr, "", idc, now_millis())
}

/// A master whose heartbeat is long stale, i.e. a dead one
pub fn dead_master_node(shard_id: &str, addr: &str, idc: &str) -> Node {
    node(shard_id, addr, "", idc, now_millis() - 3_600_000)
}

/// A slave replicating from `master_addr`
pub fn slave_node(shard_id: &str, addr: &str, master_addr: &str, idc: &str) -> Node {
    node(shard_id, addr, master_addr, idc, now_millis())
}

/// Write a node's key into the store
pub async fn register_node(store: &MemoryStore, keys: &Keys, node: &Node) {
    store
        .put(
            &keys.node_key(&node.addr()),
            &serde_json::to_string(node).unwrap(),
            None,
        )
        .await
        .unwrap();
}
