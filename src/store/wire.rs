//! Store protocol between [`StoreServer`](super::StoreServer) and
//! [`RemoteStore`](super::RemoteStore).
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. A `Watch`
//! request turns its connection into a one-way event stream; every other
//! request gets exactly one response frame.

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{Result, TitanError};
use crate::store::{KeyValue, WatchEvent};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub type Connection = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream) -> Connection {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_framed(stream)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreRequest {
    Ping,
    Get {
        key: String,
    },
    Put {
        key: String,
        value: String,
    },
    PutIfVersion {
        key: String,
        value: String,
        expected: u64,
    },
    Delete {
        key: String,
    },
    List {
        prefix: String,
    },
    Watch {
        prefix: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Conflict,
    NotFound,
    AlreadyExists,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreResponse {
    Pong,
    Value { kv: Option<KeyValue> },
    Revision { revision: u64 },
    Deleted { existed: bool },
    Items { items: Vec<KeyValue> },
    /// Watch registered; events follow
    Watching,
    Event { event: WatchEvent },
    Error { code: ErrorCode, message: String },
}

impl StoreResponse {
    pub fn from_error(err: &TitanError) -> Self {
        let (code, message) = match err {
            TitanError::Conflict(key) => (ErrorCode::Conflict, key.clone()),
            TitanError::NotFound(key) => (ErrorCode::NotFound, key.clone()),
            TitanError::AlreadyExists(key) => (ErrorCode::AlreadyExists, key.clone()),
            other => (ErrorCode::Internal, other.to_string()),
        };
        StoreResponse::Error { code, message }
    }

    /// Turn an `Error` frame back into the matching [`TitanError`].
    pub fn into_result(self) -> Result<StoreResponse> {
        match self {
            StoreResponse::Error { code, message } => Err(match code {
                ErrorCode::Conflict => TitanError::Conflict(message),
                ErrorCode::NotFound => TitanError::NotFound(message),
                ErrorCode::AlreadyExists => TitanError::AlreadyExists(message),
                ErrorCode::Internal => TitanError::Internal(message),
            }),
            other => Ok(other),
        }
    }
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}

pub async fn send<T: Serialize>(conn: &mut Connection, msg: &T) -> Result<()> {
    conn.send(encode(msg)?).await?;
    Ok(())
}

/// Next message, or `None` once the peer closed the connection.
pub async fn recv<T: DeserializeOwned>(conn: &mut Connection) -> Result<Option<T>> {
    match conn.next().await {
        Some(frame) => Ok(Some(decode(&frame?)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_tagged_by_op() {
        let req = StoreRequest::PutIfVersion {
            key: "/k".to_string(),
            value: "v".to_string(),
            expected: 3,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["op"], "put_if_version");
        assert_eq!(json["expected"], 3);
    }

    #[test]
    fn error_frames_map_back_to_errors() {
        let frame = StoreResponse::from_error(&TitanError::Conflict("/k".to_string()));
        let bytes = encode(&frame).unwrap();
        let decoded: StoreResponse = decode(&bytes).unwrap();
        assert!(matches!(
            decoded.into_result(),
            Err(TitanError::Conflict(key)) if key == "/k"
        ));

        let internal = StoreResponse::from_error(&TitanError::Timeout("get".to_string()));
        assert!(matches!(
            internal.into_result(),
            Err(TitanError::Internal(_))
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode::<StoreRequest>(b"not json").is_err());
        assert!(decode::<StoreRequest>(br#"{"op":"explode"}"#).is_err());
    }
}
