//! Wire protocol between [`crate::client::BrokerClient`] and the broker.
//!
//! Every frame is a big-endian `u32` length followed by that many bytes of
//! JSON.  Requests carry a client-chosen `id`; the matching [`Response`]
//! echoes it, which lets one connection multiplex many in-flight requests.
//! Byte payloads travel base64-encoded.
//!
//! ```text
//! ┌──────────┬───────────────────────────────────────────────┐
//! │ len: u32 │ {"id":7,"command":{"op":"get","bucket":..}}   │
//! └──────────┴───────────────────────────────────────────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BrokerError, BrokerResult};
use crate::kv::{BucketConfig, BucketStatus, KvEntry, WriteMode};

/// Largest frame either side accepts (8 MiB).
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// A client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Operations a client can ask the broker to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Ping,
    CreateBucket {
        config: BucketConfig,
    },
    BucketStatus {
        bucket: String,
    },
    DeleteBucket {
        bucket: String,
    },
    Get {
        bucket: String,
        key: String,
    },
    Write {
        bucket: String,
        key: String,
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
        mode: WriteMode,
    },
    Remove {
        bucket: String,
        key: String,
        purge: bool,
    },
    Keys {
        bucket: String,
    },
}

/// The broker's answer to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<Payload, WireError>,
}

/// Successful reply bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Pong,
    Bucket(BucketStatus),
    Entry(KvEntry),
    Revision(u64),
    Keys(Vec<String>),
    Done,
}

/// Machine-readable failure category carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    KeyExists,
    KeyNotFound,
    KeyDeleted,
    WrongLastRevision,
    BucketNotFound,
    InvalidKey,
    InvalidBucket,
    ValueTooLarge,
    Internal,
}

/// Failure reply.  `subject` is the key or bucket the error is about;
/// `revision` carries the expected revision, or the rejected length for
/// `ValueTooLarge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub subject: String,
    #[serde(default)]
    pub revision: u64,
    pub message: String,
}

impl From<&BrokerError> for WireError {
    fn from(err: &BrokerError) -> Self {
        let (code, subject, revision) = match err {
            BrokerError::KeyExists { key } => (ErrorCode::KeyExists, key.clone(), 0),
            BrokerError::KeyNotFound { key } => (ErrorCode::KeyNotFound, key.clone(), 0),
            BrokerError::KeyDeleted { key } => (ErrorCode::KeyDeleted, key.clone(), 0),
            BrokerError::WrongLastRevision { key, expected } => {
                (ErrorCode::WrongLastRevision, key.clone(), *expected)
            }
            BrokerError::BucketNotFound { bucket } => {
                (ErrorCode::BucketNotFound, bucket.clone(), 0)
            }
            BrokerError::InvalidKey { key } => (ErrorCode::InvalidKey, key.clone(), 0),
            BrokerError::InvalidBucket { bucket } => (ErrorCode::InvalidBucket, bucket.clone(), 0),
            BrokerError::ValueTooLarge { key, len } => {
                (ErrorCode::ValueTooLarge, key.clone(), *len as u64)
            }
            _ => (ErrorCode::Internal, String::new(), 0),
        };
        Self {
            code,
            subject,
            revision,
            message: err.to_string(),
        }
    }
}

impl From<WireError> for BrokerError {
    fn from(err: WireError) -> Self {
        let subject = err.subject;
        match err.code {
            ErrorCode::KeyExists => Self::KeyExists { key: subject },
            ErrorCode::KeyNotFound => Self::KeyNotFound { key: subject },
            ErrorCode::KeyDeleted => Self::KeyDeleted { key: subject },
            ErrorCode::WrongLastRevision => Self::WrongLastRevision {
                key: subject,
                expected: err.revision,
            },
            ErrorCode::BucketNotFound => Self::BucketNotFound { bucket: subject },
            ErrorCode::InvalidKey => Self::InvalidKey { key: subject },
            ErrorCode::InvalidBucket => Self::InvalidBucket { bucket: subject },
            ErrorCode::ValueTooLarge => Self::ValueTooLarge {
                key: subject,
                len: err.revision as usize,
            },
            ErrorCode::Internal => Self::Remote(err.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Write one length-prefixed JSON frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> BrokerResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode_frame(frame)?;
    write_encoded(writer, &body).await?;
    Ok(())
}

/// Serialize one frame body, enforcing [`MAX_FRAME_LEN`].
pub fn encode_frame<T: Serialize>(frame: &T) -> BrokerResult<Vec<u8>> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(BrokerError::Protocol(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            body.len()
        )));
    }
    Ok(body)
}

/// Write a body produced by [`encode_frame`] with its length prefix.
pub async fn write_encoded<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Read one frame.  Returns `Ok(None)` when the peer closed the stream
/// cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> BrokerResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(BrokerError::Protocol(format!(
            "peer announced frame of {len} bytes, limit is {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// `serde` adapter encoding `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_survives_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = Request {
            id: 7,
            command: Command::Write {
                bucket: "sessions".into(),
                key: "scstok-1".into(),
                value: vec![0, 159, 255, b'a'],
                mode: WriteMode::Create,
            },
        };

        write_frame(&mut a, &request).await.unwrap();
        drop(a);

        let got: Request = read_frame(&mut b).await.unwrap().expect("one frame");
        assert_eq!(got.id, 7);
        match got.command {
            Command::Write {
                value, mode, key, ..
            } => {
                assert_eq!(value, vec![0, 159, 255, b'a']);
                assert_eq!(mode, WriteMode::Create);
                assert_eq!(key, "scstok-1");
            }
            other => panic!("unexpected command: {other:?}"),
        }

        // Stream closed cleanly after the frame.
        let next: Option<Request> = read_frame(&mut b).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();

        let result: BrokerResult<Option<Request>> = read_frame(&mut b).await;
        assert!(matches!(result, Err(BrokerError::Protocol(_))));
    }

    #[test]
    fn wire_errors_keep_their_kind() {
        let original = BrokerError::WrongLastRevision {
            key: "k".into(),
            expected: 4,
        };
        let back: BrokerError = WireError::from(&original).into();
        assert!(matches!(
            back,
            BrokerError::WrongLastRevision { ref key, expected: 4 } if key == "k"
        ));

        let io = BrokerError::Io(std::io::Error::other("disk full"));
        let back: BrokerError = WireError::from(&io).into();
        assert!(matches!(back, BrokerError::Remote(ref m) if m.contains("disk full")));
    }

    #[test]
    fn error_reply_serializes_as_err() {
        let response = Response {
            id: 1,
            result: Err(WireError::from(&BrokerError::KeyNotFound { key: "x".into() })),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["result"]["Err"]["code"], "key_not_found");
        assert_eq!(json["result"]["Err"]["subject"], "x");
    }
}
