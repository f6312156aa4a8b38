//! Gateway assembly
//!
//! Wires the store, cluster view, route cache, watcher, and failover
//! coordinator together, then hands out queriers and appenders bound to
//! the shared state.

use crate::cluster::{ClusterView, FailoverCoordinator, MetaWatcher};
use crate::config::Config;
use crate::ingester::FanoutAppender;
use crate::query::FanoutQuerier;
use crate::route::RouteTable;
use crate::shard::ConnectionPools;
use crate::store::{EtcdStore, Keys, MetaStore};
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Gateway {
    config: Config,
    view: Arc<ClusterView>,
    routes: Arc<RouteTable>,
    pools: Arc<ConnectionPools>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Connect to the configured etcd endpoints and start coordinating
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        let store = Arc::new(EtcdStore::connect(&config.store).await?);
        Self::with_store(config, store).await
    }

    /// Assemble on top of an already-built store; the entry point for
    /// tests and embedded single-process setups
    pub async fn with_store(config: Config, store: Arc<dyn MetaStore>) -> Result<Arc<Self>> {
        let keys = Keys::new(config.store.namespace.clone());

        let view = Arc::new(ClusterView::new(store.clone(), keys.clone()));
        view.refresh().await?;

        let routes = Arc::new(RouteTable::new(
            store.clone(),
            keys.clone(),
            config.route.clone(),
        ));
        let pools = Arc::new(ConnectionPools::new(config.client.clone()));
        let failover = Arc::new(FailoverCoordinator::new(
            store.clone(),
            keys.clone(),
            view.clone(),
            config.client.clone(),
            config.failover.clone(),
        ));

        let cancel = CancellationToken::new();
        let watcher = MetaWatcher::new(
            store,
            keys,
            routes.clone(),
            view.clone(),
            failover,
            cancel.clone(),
        )
        .start();

        info!("Gateway connected");
        Ok(Arc::new(Self {
            config,
            view,
            routes,
            pools,
            cancel,
            watcher: Mutex::new(Some(watcher)),
        }))
    }

    /// A querier over `[mint, maxt]`
    pub fn querier(&self, mint: i64, maxt: i64) -> FanoutQuerier {
        FanoutQuerier::new(
            mint,
            maxt,
            self.view.clone(),
            self.routes.clone(),
            self.pools.clone(),
            self.config.query.clone(),
        )
    }

    /// A fresh appender for one ingest stream
    pub fn appender(&self) -> FanoutAppender {
        FanoutAppender::new(
            self.routes.clone(),
            self.view.clone(),
            self.pools.clone(),
            self.config.append.clone(),
        )
    }

    /// The live cluster view
    pub fn cluster_view(&self) -> Arc<ClusterView> {
        self.view.clone()
    }

    /// The route cache
    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.clone()
    }

    /// Stop the watcher and wait for it to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.watcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Gateway stopped");
    }
}
