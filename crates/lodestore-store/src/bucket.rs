//! Bucket provisioning.

use std::sync::Arc;
use std::time::Duration;

use lodestore_broker::{BucketConfig, KeyValue, KvConnection};
use tracing::{info, instrument};

use crate::error::StoreResult;

/// Requested shape of a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSettings {
    pub name: String,
    /// Zero disables expiry.
    pub ttl: Duration,
    pub compression: bool,
}

impl BucketSettings {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
            compression: false,
        }
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }
}

impl From<&BucketSettings> for BucketConfig {
    fn from(settings: &BucketSettings) -> Self {
        BucketConfig::new(settings.name.clone())
            .with_ttl(settings.ttl)
            .with_compression(settings.compression)
    }
}

/// Create the bucket, or attach to it if it already exists.
///
/// An existing bucket whose TTL or compression differ is reconfigured to
/// `settings`; the broker logs the change.  Calling this repeatedly with the
/// same name never fails because the bucket exists.
#[instrument(skip(conn), fields(bucket = %settings.name))]
pub async fn ensure_bucket(
    conn: &dyn KvConnection,
    settings: &BucketSettings,
) -> StoreResult<Arc<dyn KeyValue>> {
    let kv = conn.create_key_value(BucketConfig::from(settings)).await?;
    info!(
        ttl = ?settings.ttl,
        compression = settings.compression,
        "bucket ready"
    );
    Ok(kv)
}
