use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TitanError};
use crate::store::wire::{self, Connection, StoreRequest, StoreResponse};
use crate::store::{KeyValue, Store, Watch};

/// [`Store`] client for a [`StoreServer`](super::StoreServer).
///
/// Unary calls share one connection. A call that fails part way drops it and
/// the next call dials again. Every watch gets a connection of its own.
#[derive(Debug)]
pub struct RemoteStore {
    addr: String,
    conn: Mutex<Option<Connection>>,
}

impl RemoteStore {
    /// Dial `addr` and check the server answers. Failing here is fatal for
    /// the caller: nothing works without the store.
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let store = Self {
            addr: addr.into(),
            conn: Mutex::new(None),
        };
        match store.call(StoreRequest::Ping).await? {
            StoreResponse::Pong => {
                tracing::info!(addr = %store.addr, "Connected to store");
                Ok(store)
            }
            other => Err(unexpected(other)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<Connection> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TitanError::Connection(format!("{}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(wire::framed(stream))
    }

    async fn call(&self, request: StoreRequest) -> Result<StoreResponse> {
        let mut slot = self.conn.lock().await;
        // Taken out for the round trip so a failed or abandoned call never
        // leaves a half-read connection behind.
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.dial().await?,
        };

        wire::send(&mut conn, &request).await?;
        let response = wire::recv::<StoreResponse>(&mut conn)
            .await?
            .ok_or_else(|| TitanError::Connection(format!("{}: connection closed", self.addr)))?;

        *slot = Some(conn);
        response.into_result()
    }
}

fn unexpected(response: StoreResponse) -> TitanError {
    TitanError::Protocol(format!("unexpected response: {:?}", response))
}

#[async_trait]
impl Store for RemoteStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        match self.call(StoreRequest::Get { key: key.to_string() }).await? {
            StoreResponse::Value { kv } => Ok(kv),
            other => Err(unexpected(other)),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<u64> {
        let request = StoreRequest::Put {
            key: key.to_string(),
            value,
        };
        match self.call(request).await? {
            StoreResponse::Revision { revision } => Ok(revision),
            other => Err(unexpected(other)),
        }
    }

    async fn put_if_version(&self, key: &str, value: String, expected: u64) -> Result<u64> {
        let request = StoreRequest::PutIfVersion {
            key: key.to_string(),
            value,
            expected,
        };
        match self.call(request).await? {
            StoreResponse::Revision { revision } => Ok(revision),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self.call(StoreRequest::Delete { key: key.to_string() }).await? {
            StoreResponse::Deleted { existed } => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let request = StoreRequest::List {
            prefix: prefix.to_string(),
        };
        match self.call(request).await? {
            StoreResponse::Items { items } => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    async fn watch(&self, prefix: &str, cancel: CancellationToken) -> Result<Watch> {
        let mut conn = self.dial().await?;
        wire::send(
            &mut conn,
            &StoreRequest::Watch {
                prefix: prefix.to_string(),
            },
        )
        .await?;

        match wire::recv::<StoreResponse>(&mut conn).await? {
            Some(StoreResponse::Watching) => {}
            Some(other) => return Err(unexpected(other.into_result()?)),
            None => {
                return Err(TitanError::Connection(format!(
                    "{}: closed before watch started",
                    self.addr
                )))
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let scope = cancel.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = tx.closed() => break,
                    frame = wire::recv::<StoreResponse>(&mut conn) => frame,
                };
                match frame {
                    Ok(Some(StoreResponse::Event { event })) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(Some(other)) => {
                        tracing::warn!(prefix = %prefix, response = ?other, "Unexpected frame on watch stream");
                    }
                    Ok(None) => {
                        tracing::warn!(prefix = %prefix, "Store closed watch stream");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(prefix = %prefix, error = %e, "Watch stream failed");
                        break;
                    }
                }
            }
        });

        Ok(Watch::new(rx, cancel))
    }
}
