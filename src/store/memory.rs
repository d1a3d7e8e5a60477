use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TitanError};
use crate::store::{KeyValue, Store, Watch, WatchEvent, WatchEventKind};

#[derive(Debug)]
struct Entry {
    value: String,
    version: u64,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    data: BTreeMap<String, Entry>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn apply_put(&mut self, key: &str, value: String) -> u64 {
        self.revision += 1;
        let revision = self.revision;
        let created = self
            .data
            .insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    version: revision,
                },
            )
            .is_none();
        self.notify(WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
            value,
            revision,
            created,
        });
        revision
    }

    /// Fan out under the lock so every watcher sees mutations in revision
    /// order. Closed watchers are dropped here.
    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            if event.key.starts_with(&w.prefix) {
                w.tx.send(event.clone()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
    }
}

/// In-process [`Store`] engine.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest revision handed out.
    pub async fn revision(&self) -> u64 {
        self.inner.lock().await.revision
    }

    pub async fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let inner = self.inner.lock().await;
        Ok(inner.data.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            version: e.version,
        }))
    }

    async fn put(&self, key: &str, value: String) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        Ok(inner.apply_put(key, value))
    }

    async fn put_if_version(&self, key: &str, value: String, expected: u64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let current = inner.data.get(key).map(|e| e.version).unwrap_or(0);
        if current != expected {
            tracing::trace!(key, expected, current, "Conditional put rejected");
            return Err(TitanError::Conflict(key.to_string()));
        }
        Ok(inner.apply_put(key, value))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(old) = inner.data.remove(key) else {
            return Ok(false);
        };
        inner.revision += 1;
        let revision = inner.revision;
        inner.notify(WatchEvent {
            kind: WatchEventKind::Delete,
            key: key.to_string(),
            value: old.value,
            revision,
            created: false,
        });
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                version: e.version,
            })
            .collect())
    }

    async fn watch(&self, prefix: &str, cancel: CancellationToken) -> Result<Watch> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().await.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        tracing::debug!(prefix, "Watch registered");
        Ok(Watch::new(rx, cancel))
    }
}
