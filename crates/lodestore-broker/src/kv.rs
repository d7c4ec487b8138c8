//! Key-value capability exposed by the broker.
//!
//! A [`KvConnection`] provisions buckets; each bucket is reached through a
//! [`KeyValue`] handle.  Both traits are implemented twice: over the TCP wire
//! protocol ([`crate::client::BrokerClient`]) and in-process
//! ([`crate::engine::LocalConnection`]), so adapters built on top of them never
//! know which one they talk to.
//!
//! # Semantics
//!
//! - TTL is a bucket property, measured from each key's last write.
//! - [`KeyValue::create`] fails with `KeyExists` only when a live value is
//!   present; absent, expired, and deleted keys can be created.
//! - [`KeyValue::put`] always succeeds and renews the key's TTL clock.
//! - [`KeyValue::get`] reports `KeyNotFound` for absent/expired keys and
//!   `KeyDeleted` for delete/purge markers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

/// Longest key the engines accept, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Longest value a single write may carry.  Keeps base64-encoded write
/// frames under [`crate::protocol::MAX_FRAME_LEN`].
pub const MAX_VALUE_LEN: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Configuration of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Bucket name, `[A-Za-z0-9_-]+`.
    pub name: String,
    /// Expiry applied to every key from its last write.  Zero disables expiry.
    pub ttl: Duration,
    /// Store values deflate-compressed.
    pub compression: bool,
}

impl BucketConfig {
    /// A bucket with no TTL and no compression.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl: Duration::ZERO,
            compression: false,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }
}

/// The operation recorded by an entry's latest write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Put,
    Delete,
    Purge,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Delete => "delete",
            Self::Purge => "purge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "put" => Some(Self::Put),
            "delete" => Some(Self::Delete),
            "purge" => Some(Self::Purge),
            _ => None,
        }
    }
}

/// A live value read from a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    pub bucket: String,
    pub key: String,
    #[serde(with = "crate::protocol::base64_bytes")]
    pub value: Vec<u8>,
    /// Bucket-wide revision assigned by the write that produced this value.
    pub revision: u64,
    pub operation: Operation,
    /// When the value was written.
    pub created: DateTime<Utc>,
}

impl KvEntry {
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }
}

/// Snapshot of a bucket's configuration and contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStatus {
    pub name: String,
    pub ttl: Duration,
    pub compression: bool,
    /// Number of live values.
    pub values: u64,
    /// Latest revision handed out in this bucket.
    pub revision: u64,
}

/// How a write treats an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WriteMode {
    /// Unconditional overwrite.
    Put,
    /// Only succeeds when no live value exists.
    Create,
    /// Only succeeds when the live value carries `revision`.
    Update { revision: u64 },
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Handle to a single bucket.
#[async_trait]
pub trait KeyValue: Send + Sync {
    /// The bucket this handle is bound to.
    fn bucket(&self) -> &str;

    /// Read the live value under `key`.
    async fn get(&self, key: &str) -> BrokerResult<KvEntry>;

    /// Unconditionally write `value`; returns the new revision.
    async fn put(&self, key: &str, value: &[u8]) -> BrokerResult<u64>;

    /// Write `value` only if no live value exists; returns the new revision.
    async fn create(&self, key: &str, value: &[u8]) -> BrokerResult<u64>;

    /// Write `value` only if the live value is at `revision`.
    async fn update(&self, key: &str, value: &[u8], revision: u64) -> BrokerResult<u64>;

    /// Leave a delete marker under `key`.
    async fn delete(&self, key: &str) -> BrokerResult<()>;

    /// Discard the value and leave a purge marker under `key`.
    async fn purge(&self, key: &str) -> BrokerResult<()>;

    /// Keys holding live values, sorted.
    async fn keys(&self) -> BrokerResult<Vec<String>>;

    /// Configuration and counters of the bucket.
    async fn status(&self) -> BrokerResult<BucketStatus>;
}

/// A connection able to provision buckets.
#[async_trait]
pub trait KvConnection: Send + Sync {
    /// Create the bucket, or attach to an existing bucket of the same name,
    /// reconciling its TTL and compression to `config`.
    async fn create_key_value(&self, config: BucketConfig) -> BrokerResult<Arc<dyn KeyValue>>;

    /// Attach to an existing bucket.
    async fn key_value(&self, bucket: &str) -> BrokerResult<Arc<dyn KeyValue>>;

    /// Remove a bucket and all of its entries.
    async fn delete_key_value(&self, bucket: &str) -> BrokerResult<()>;

    /// Close the connection.  Subsequent requests fail with
    /// `ConnectionClosed`.  Closing twice is a no-op.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Reject keys the engines cannot store.
pub fn validate_key(key: &str) -> BrokerResult<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b'='));
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidKey {
            key: key.to_owned(),
        })
    }
}

/// Reject values larger than [`MAX_VALUE_LEN`].
pub fn validate_value(key: &str, value: &[u8]) -> BrokerResult<()> {
    if value.len() > MAX_VALUE_LEN {
        return Err(BrokerError::ValueTooLarge {
            key: key.to_owned(),
            len: value.len(),
        });
    }
    Ok(())
}

/// Reject bucket names the engines cannot store.
pub fn validate_bucket(bucket: &str) -> BrokerResult<()> {
    let valid = !bucket.is_empty()
        && bucket
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidBucket {
            bucket: bucket.to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
