use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{Result, TitanError};
use crate::model::{Node, NodeStatus, Resource};
use crate::store::{node_key, ClusterStore};

/// Rounds of read-merge-write before a beat gives up on a busy record.
const BEAT_ATTEMPTS: usize = 5;

/// Keeps this agent's node record alive.
///
/// Each beat merges identity, capacity and liveness into the stored record
/// and leaves `allocated` and `assignments` exactly as the scheduler wrote
/// them.
pub struct HeartbeatSender {
    store: ClusterStore,
    node_id: String,
    address: String,
    version: String,
    capacity: Resource,
    interval: Duration,
    shrink_deferred: AtomicBool,
}

impl HeartbeatSender {
    pub fn new(store: ClusterStore, config: &AgentConfig) -> Self {
        Self {
            store,
            node_id: config.node_id.clone(),
            address: config.address.clone(),
            version: config.version.clone(),
            capacity: config.capacity,
            interval: Duration::from_millis(config.heartbeat_interval_ms),
            shrink_deferred: AtomicBool::new(false),
        }
    }

    /// Send one heartbeat, creating the node record if there is none.
    pub async fn beat(&self) -> Result<()> {
        for _ in 0..BEAT_ATTEMPTS {
            let now = Utc::now().timestamp();
            let (node, expected) = match self.store.get_node(&self.node_id).await? {
                Some(current) => {
                    let mut node = current.value;
                    node.ip = self.address.clone();
                    node.version = self.version.clone();
                    self.merge_capacity(&mut node);
                    node.status = NodeStatus::Ready;
                    node.last_heartbeat = now;
                    (node, current.version)
                }
                None => {
                    let mut node = Node::new(
                        self.node_id.as_str(),
                        self.address.as_str(),
                        self.version.as_str(),
                        self.capacity,
                    );
                    node.last_heartbeat = now;
                    tracing::info!(node_id = %self.node_id, capacity = %self.capacity, "Registering node");
                    (node, 0)
                }
            };

            match self.store.put_node_if(&node, expected).await {
                Ok(_) => {
                    tracing::trace!(node_id = %self.node_id, "Heartbeat sent");
                    return Ok(());
                }
                // The scheduler wrote in between; merge again
                Err(TitanError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TitanError::Conflict(node_key(&self.node_id)))
    }

    /// Adopt the configured capacity unless it would leave the node holding
    /// more than it has. A shrink below the current reservations waits until
    /// enough of them drain.
    fn merge_capacity(&self, node: &mut Node) {
        if node.total_cap == self.capacity {
            return;
        }
        if node.allocated.fits_within(&self.capacity) {
            tracing::info!(
                node_id = %self.node_id,
                from = %node.total_cap,
                to = %self.capacity,
                "Node capacity changed"
            );
            node.total_cap = self.capacity;
            self.shrink_deferred.store(false, Ordering::Relaxed);
        } else if !self.shrink_deferred.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                node_id = %self.node_id,
                allocated = %node.allocated,
                capacity = %self.capacity,
                keeping = %node.total_cap,
                "Capacity below current reservations, deferring until they drain"
            );
        }
    }

    /// Beat once per interval until cancelled, starting one interval from
    /// now; the caller sends the first beat. Failed beats are logged and the
    /// loop carries on.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.beat().await {
                tracing::warn!(node_id = %self.node_id, error = %e, "Heartbeat failed");
            }
        }
        tracing::debug!(node_id = %self.node_id, "Heartbeat stopped");
    }
}
