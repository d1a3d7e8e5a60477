use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::Result;
use crate::store::wire::{self, Connection, StoreRequest, StoreResponse};
use crate::store::Store;

/// Serves a [`Store`] to other processes over TCP.
pub struct StoreServer {
    addr: SocketAddr,
    store: Arc<dyn Store>,
}

impl StoreServer {
    pub fn new(addr: SocketAddr, store: Arc<dyn Store>) -> Self {
        Self { addr, store }
    }

    /// Bind the configured address and serve until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        serve(listener, self.store, cancel).await
    }
}

/// Accept loop over an already bound listener. Open connections are closed
/// and drained before this returns.
pub async fn serve(
    listener: TcpListener,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
) -> Result<()> {
    let tracker = TaskTracker::new();
    tracing::info!(addr = ?listener.local_addr().ok(), "Store server listening");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let store = store.clone();
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    if let Err(e) = handle_connection(stream, store, cancel).await {
                        tracing::debug!(peer = %peer, error = %e, "Store connection closed with error");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept store connection");
            }
        }
    }

    tracker.close();
    tracker.wait().await;
    tracing::info!("Store server stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut conn = wire::framed(stream);

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            request = wire::recv::<StoreRequest>(&mut conn) => request?,
        };
        let Some(request) = request else {
            return Ok(());
        };

        if let StoreRequest::Watch { prefix } = request {
            return stream_watch(conn, store, prefix, cancel).await;
        }

        let response = dispatch(store.as_ref(), request).await;
        wire::send(&mut conn, &response).await?;
    }
}

async fn dispatch(store: &dyn Store, request: StoreRequest) -> StoreResponse {
    let result = match request {
        StoreRequest::Ping => Ok(StoreResponse::Pong),
        StoreRequest::Get { key } => store.get(&key).await.map(|kv| StoreResponse::Value { kv }),
        StoreRequest::Put { key, value } => store
            .put(&key, value)
            .await
            .map(|revision| StoreResponse::Revision { revision }),
        StoreRequest::PutIfVersion {
            key,
            value,
            expected,
        } => store
            .put_if_version(&key, value, expected)
            .await
            .map(|revision| StoreResponse::Revision { revision }),
        StoreRequest::Delete { key } => store
            .delete(&key)
            .await
            .map(|existed| StoreResponse::Deleted { existed }),
        StoreRequest::List { prefix } => store
            .list(&prefix)
            .await
            .map(|items| StoreResponse::Items { items }),
        StoreRequest::Watch { .. } => Ok(StoreResponse::Error {
            code: wire::ErrorCode::Internal,
            message: "watch is not a unary request".to_string(),
        }),
    };

    result.unwrap_or_else(|e| StoreResponse::from_error(&e))
}

async fn stream_watch(
    mut conn: Connection,
    store: Arc<dyn Store>,
    prefix: String,
    cancel: CancellationToken,
) -> Result<()> {
    let scope = cancel.child_token();
    let mut watch = store.watch(&prefix, scope.clone()).await?;
    wire::send(&mut conn, &StoreResponse::Watching).await?;
    tracing::debug!(prefix = %prefix, "Remote watch started");

    let result = loop {
        tokio::select! {
            event = watch.next() => match event {
                Some(event) => {
                    if let Err(e) = wire::send(&mut conn, &StoreResponse::Event { event }).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
            // Clients never send after Watch; any read result means hang-up.
            _ = conn.next() => break Ok(()),
        }
    };

    scope.cancel();
    tracing::debug!(prefix = %prefix, "Remote watch ended");
    result
}
