//! Membership watcher
//!
//! One background task subscribed to the route, group-route-key, and
//! node prefixes of the consensus store. Deltas land in the route cache;
//! node changes republish the cluster view; node deaths feed the
//! failover coordinator. Losing any stream forces a full refresh before
//! deltas are trusted again.

use super::{ClusterView, FailoverCoordinator, Node};
use crate::route::RouteTable;
use crate::store::{EventKind, Keys, MetaStore, WatchEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct MetaWatcher {
    store: Arc<dyn MetaStore>,
    keys: Keys,
    routes: Arc<RouteTable>,
    view: Arc<ClusterView>,
    failover: Arc<FailoverCoordinator>,
    cancel: CancellationToken,
}

impl MetaWatcher {
    pub fn new(
        store: Arc<dyn MetaStore>,
        keys: Keys,
        routes: Arc<RouteTable>,
        view: Arc<ClusterView>,
        failover: Arc<FailoverCoordinator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            keys,
            routes,
            view,
            failover,
            cancel,
        }
    }

    /// Run the watch loop until cancelled
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Watching store events");
            loop {
                if self.cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "Watch session ended, resubscribing");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        })
    }

    /// Subscribe all three prefixes, refresh, then apply deltas until a
    /// stream closes or the watcher is cancelled.
    async fn run_once(&self) -> crate::Result<()> {
        let mut route_rx = self
            .store
            .watch_prefix(&self.keys.route_prefix(), false)
            .await?;
        let mut sgroute_rx = self
            .store
            .watch_prefix(&self.keys.sgroute_prefix(), false)
            .await?;
        let mut node_rx = self.store.watch_prefix(&self.keys.node_prefix(), true).await?;

        // Deltas recorded between subscription and this refresh are
        // applied on top of it; applying them twice is harmless.
        self.view.refresh().await?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                event = route_rx.recv() => match event {
                    Some(event) => self.on_route_event(event),
                    None => return self.stream_lost("route"),
                },
                event = sgroute_rx.recv() => match event {
                    Some(event) => self.on_sgroute_event(event),
                    None => return self.stream_lost("sgroute"),
                },
                event = node_rx.recv() => match event {
                    Some(event) => self.on_node_event(event).await,
                    None => return self.stream_lost("node"),
                },
            }
        }
    }

    fn stream_lost(&self, which: &str) -> crate::Result<()> {
        Err(crate::Error::Internal(format!("{which} watch stream closed")))
    }

    fn on_route_event(&self, event: WatchEvent) {
        let Some((metric, day)) = self.keys.parse_route_key(&event.key) else {
            warn!(key = %event.key, "Unparseable route key in watch event");
            return;
        };

        match event.kind {
            EventKind::Put => match serde_json::from_str::<Vec<String>>(&event.value) {
                Ok(group) => {
                    debug!(metric, day, group = ?group, "Route updated from watch");
                    self.routes.apply_route_put(&metric, day, group);
                }
                Err(e) => warn!(metric, day, error = %e, "Unparseable shard group in watch event"),
            },
            EventKind::Delete => {
                debug!(metric, day, "Route deleted from watch");
                self.routes.invalidate(&metric, day);
            }
        }
    }

    fn on_sgroute_event(&self, event: WatchEvent) {
        let Some(metric) = self.keys.parse_sgroute_key(&event.key) else {
            warn!(key = %event.key, "Unparseable sgroute key in watch event");
            return;
        };

        match event.kind {
            EventKind::Put => self.routes.set_group_route_key(&metric, &event.value),
            EventKind::Delete => self.routes.set_group_route_key(&metric, ""),
        }
    }

    async fn on_node_event(&self, event: WatchEvent) {
        if event.kind == EventKind::Delete {
            match event.prev_value.as_deref().map(serde_json::from_str::<Node>) {
                Some(Ok(node)) => {
                    warn!(key = %event.key, shard_id = %node.shard_id, "Node key deleted");
                    // The promotion can wait on the store mutex and the
                    // slave's reply; keep the watch loop responsive.
                    let failover = Arc::clone(&self.failover);
                    tokio::spawn(async move {
                        let _ = failover.failover_if_needed(&node).await;
                    });
                }
                Some(Err(e)) => {
                    warn!(key = %event.key, error = %e, "Undecodable previous node value")
                }
                None => warn!(key = %event.key, "Node delete event without previous value"),
            }
        }

        if let Err(e) = self.view.refresh().await {
            warn!(error = %e, "Cluster refresh after node event failed");
        }
    }
}
