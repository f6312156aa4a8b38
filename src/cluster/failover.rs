//! Master failover
//!
//! When a node key disappears and the node's last heartbeat is older
//! than the session TTL, the gateway promotes a surviving slave of that
//! shard by sending it a "slave of no one" command. A per-shard latch
//! stops redundant re-entry inside one process; the store's global
//! mutex serialises gateways, so at most one promotion per shard is in
//! flight cluster-wide.

use super::{ClusterView, Node};
use crate::config::{ClientConfig, FailoverConfig};
use crate::shard::{Connection, Request, Response, SlaveOfCommand, StatusCode};
use crate::store::{Keys, MetaStore};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct FailoverCoordinator {
    store: Arc<dyn MetaStore>,
    keys: Keys,
    view: Arc<ClusterView>,
    client_config: ClientConfig,
    config: FailoverConfig,
}

impl FailoverCoordinator {
    pub fn new(
        store: Arc<dyn MetaStore>,
        keys: Keys,
        view: Arc<ClusterView>,
        client_config: ClientConfig,
        config: FailoverConfig,
    ) -> Self {
        Self {
            store,
            keys,
            view,
            client_config,
            config,
        }
    }

    /// Promote a slave of `dead`'s shard if the node is really gone.
    ///
    /// Called by the watcher on every node-key DELETE. Errors are
    /// returned for logging; the next node event re-drives
    /// reconciliation, so callers treat them as non-fatal.
    pub async fn failover_if_needed(&self, dead: &Node) -> Result<()> {
        let Some(shard) = self.view.shard(&dead.shard_id) else {
            return Ok(());
        };

        if dead.may_online(self.config.session_expire_ttl) {
            debug!(
                shard_id = %dead.shard_id,
                addr = %dead.addr(),
                "Node key vanished but heartbeat is fresh, skipping failover"
            );
            return Ok(());
        }

        if !shard.begin_failover() {
            return Ok(());
        }
        let result = self.run_locked(dead).await;
        shard.end_failover();

        if let Err(e) = &result {
            error!(shard_id = %dead.shard_id, error = %e, "Failover failed");
        }
        result
    }

    async fn run_locked(&self, dead: &Node) -> Result<()> {
        let lock_key = self.store.lock(&self.keys.mutex_name("failover")).await?;

        let result = self.promote(dead).await;

        // Whatever happened, republish the view before letting go of the
        // mutex so subsequent reads in this process see the outcome.
        if let Err(e) = self.view.refresh().await {
            warn!(error = %e, "Cluster refresh after failover failed");
        }

        let unlocked = self.store.unlock(lock_key).await;
        result.and(unlocked)
    }

    async fn promote(&self, dead: &Node) -> Result<()> {
        if let Some(master) = self.view.master(&dead.shard_id) {
            if master.addr() != dead.addr() {
                debug!(
                    shard_id = %dead.shard_id,
                    master = %master.addr(),
                    "Already failed over by another gateway"
                );
                return Ok(());
            }
        }

        let slaves = self.view.slaves(&dead.shard_id);
        if slaves.is_empty() {
            return Err(Error::NoAvailableSlave(dead.shard_id.clone()));
        }

        let chosen = slaves
            .iter()
            .find(|s| s.idc == dead.idc)
            .unwrap_or(&slaves[0]);

        warn!(
            shard_id = %dead.shard_id,
            chosen = %chosen.addr(),
            idc = %chosen.idc,
            "Failover triggered"
        );

        let mut conn = Connection::connect(&chosen.addr(), &self.client_config).await?;
        conn.send(&Request::SlaveOf(SlaveOfCommand::no_one())).await?;

        match tokio::time::timeout(self.config.reply_timeout, conn.recv()).await {
            Err(_) => {
                // Outcome unknown; the next node event reconciles.
                warn!(
                    shard_id = %dead.shard_id,
                    chosen = %chosen.addr(),
                    "No promotion reply within deadline"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(Response::General(reply))) => {
                if reply.status == StatusCode::Succeed {
                    warn!(shard_id = %dead.shard_id, chosen = %chosen.addr(), "Failover succeeded");
                    Ok(())
                } else {
                    Err(Error::ShardFailed {
                        shard_id: dead.shard_id.clone(),
                        message: reply.message,
                    })
                }
            }
            Ok(Ok(_)) => Err(Error::ShardFailed {
                shard_id: dead.shard_id.clone(),
                message: "Unexpected promotion reply type".to_string(),
            }),
        }
    }
}
