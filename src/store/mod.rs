//! The coordination store.
//!
//! Everything the scheduler and the agents share goes through a [`Store`]: a
//! key-value map with per-key versions, a conditional put, and prefix
//! watches. The scheduler and agents never talk to each other directly.
//!
//! # Components
//!
//! - [`MemoryStore`]: the in-process engine
//! - [`StoreServer`] / [`RemoteStore`]: serve an engine over TCP and consume it
//!   from another process
//! - [`ClusterStore`]: typed, timeout-bounded access to the job, node and log
//!   namespaces
//!
//! # Ordering
//!
//! Revisions come from one counter per store. A watcher receives events in
//! revision order and never drops one, so writes to a single key are observed
//! in the order they were applied.

pub mod cluster;
pub mod memory;
pub mod remote;
pub mod server;
pub mod wire;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use cluster::{ClusterStore, JobWatch, LogRecord, Versioned};
pub use memory::MemoryStore;
pub use remote::RemoteStore;
pub use server::StoreServer;

pub const JOB_PREFIX: &str = "/titan/jobs/";
pub const NODE_PREFIX: &str = "/titan/nodes/";
pub const LOG_PREFIX: &str = "/titan/logs/";

pub fn job_key(job_id: &str) -> String {
    format!("{}{}", JOB_PREFIX, job_id)
}

pub fn node_key(node_id: &str) -> String {
    format!("{}{}", NODE_PREFIX, node_id)
}

pub fn log_key(job_id: &str) -> String {
    format!("{}{}", LOG_PREFIX, job_id)
}

/// A stored value and the revision of its last write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// One mutation under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// New value for puts, last value for deletes
    pub value: String,
    pub revision: u64,
    /// Put that brought the key into existence
    pub created: bool,
}

/// Live subscription to a prefix.
///
/// Yields events until the token passed to [`Store::watch`] is cancelled or
/// the store side goes away; after that `next` always returns `None`.
#[derive(Debug)]
pub struct Watch {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    cancel: CancellationToken,
}

impl Watch {
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    pub async fn next(&mut self) -> Option<WatchEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.rx.close();
                None
            }
            event = self.rx.recv() => event,
        }
    }
}

/// Watchable key-value store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Unconditional write. Returns the new revision.
    async fn put(&self, key: &str, value: String) -> Result<u64>;

    /// Write only if the key's version equals `expected`; `0` means the key
    /// must not exist. Fails with `TitanError::Conflict` otherwise.
    async fn put_if_version(&self, key: &str, value: String, expected: u64) -> Result<u64>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All entries under `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Subscribe to every put and delete under `prefix` made after this call
    /// returns, until `cancel` fires.
    async fn watch(&self, prefix: &str, cancel: CancellationToken) -> Result<Watch>;
}
