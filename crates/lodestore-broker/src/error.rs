//! Broker error types.
//!
//! Every subsystem of the embedded broker (engines, wire protocol, client,
//! lifecycle) surfaces errors through [`BrokerError`].  Key-level variants
//! carry the key so adapters can decide how to absorb them without parsing
//! strings.

use std::time::Duration;

use crate::lifecycle::BrokerState;

/// Unified error type for the embedded broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    // -- Lifecycle errors ---------------------------------------------------
    /// The broker did not report ready-for-connections within the bounded
    /// wait, or its listener could not be bound.
    #[error("broker not ready: {reason}")]
    NotReady { reason: String },

    /// The client connection to the broker could not be established.
    #[error("failed to connect to broker at {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The client connection has been closed; no further requests are served.
    #[error("broker connection closed")]
    ConnectionClosed,

    /// A request did not receive a reply in time.
    #[error("broker request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Broker shutdown did not complete before the deadline.
    #[error("broker shutdown exceeded deadline of {deadline:?}")]
    ShutdownTimeout { deadline: Duration },

    /// The lifecycle state machine rejected a transition.
    #[error("invalid broker state transition: {from} -> {to}")]
    InvalidTransition { from: BrokerState, to: BrokerState },

    // -- Key-value errors ---------------------------------------------------
    /// A create-only write found a live entry under the key.
    #[error("key exists: {key}")]
    KeyExists { key: String },

    /// The key is absent or its entry has expired.
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    /// The key's latest entry is a delete or purge marker.
    #[error("key deleted: {key}")]
    KeyDeleted { key: String },

    /// A compare-and-set write saw a different revision than expected.
    #[error("wrong last revision for key {key}: expected {expected}")]
    WrongLastRevision { key: String, expected: u64 },

    /// The referenced bucket does not exist.
    #[error("bucket not found: {bucket}")]
    BucketNotFound { bucket: String },

    /// The key is empty, too long, or contains disallowed characters.
    #[error("invalid key: {key:?}")]
    InvalidKey { key: String },

    /// The bucket name is empty or contains disallowed characters.
    #[error("invalid bucket name: {bucket:?}")]
    InvalidBucket { bucket: String },

    /// The value exceeds the largest size a single write may carry.
    #[error("value for key {key} is {len} bytes, limit is {}", crate::kv::MAX_VALUE_LEN)]
    ValueTooLarge { key: String, len: usize },

    // -- Transport / storage ------------------------------------------------
    /// A frame was malformed, oversized, or carried an unexpected reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The broker reported an internal failure while serving a request.
    #[error("remote broker error: {0}")]
    Remote(String),

    /// Socket or filesystem I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The durable engine's SQLite store failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Frame serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl BrokerError {
    /// `true` for the two conditions that mean "there is no live value":
    /// an absent/expired key or a delete marker.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. } | Self::KeyDeleted { .. })
    }
}

impl From<tokio::task::JoinError> for BrokerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Convenience alias used throughout the broker crate.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
