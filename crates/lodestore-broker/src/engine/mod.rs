//! Storage engines behind the broker.
//!
//! An [`Engine`] owns every bucket and enforces the per-key atomicity the
//! adapters rely on: a create-only write either observes no live value and
//! writes, or fails with `KeyExists`, with no interleaving in between.
//!
//! - [`DurableEngine`] persists buckets in SQLite under the broker's storage
//!   directory.
//! - [`MemoryEngine`] keeps buckets in `moka` caches whose time-to-live is
//!   the bucket TTL.
//!
//! [`LocalConnection`] exposes an engine in-process through the same
//! [`KvConnection`] capability the TCP client implements.

mod durable;
mod memory;

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use durable::DurableEngine;
pub use memory::MemoryEngine;

use crate::error::{BrokerError, BrokerResult};
use crate::kv::{BucketConfig, BucketStatus, KeyValue, KvConnection, KvEntry, WriteMode};

/// Bucket-addressed storage operations shared by all engines.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create a bucket or attach to an existing one, reconciling its config.
    async fn create_bucket(&self, config: &BucketConfig) -> BrokerResult<BucketStatus>;

    async fn bucket_status(&self, bucket: &str) -> BrokerResult<BucketStatus>;

    async fn delete_bucket(&self, bucket: &str) -> BrokerResult<()>;

    async fn get(&self, bucket: &str, key: &str) -> BrokerResult<KvEntry>;

    /// Write `value` under `key` according to `mode`; returns the new revision.
    async fn write(
        &self,
        bucket: &str,
        key: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> BrokerResult<u64>;

    /// Leave a delete marker, or a purge marker when `purge` is set.
    /// Fails with `KeyNotFound` if the key holds nothing.
    async fn remove(&self, bucket: &str, key: &str, purge: bool) -> BrokerResult<u64>;

    async fn keys(&self, bucket: &str) -> BrokerResult<Vec<String>>;

    /// Drop expired entries; returns how many were removed.
    async fn sweep_expired(&self) -> BrokerResult<u64>;
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

pub(crate) fn compress(value: &[u8]) -> BrokerResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(value.len() / 2), Compression::fast());
    encoder.write_all(value)?;
    Ok(encoder.finish()?)
}

pub(crate) fn decompress(value: &[u8]) -> BrokerResult<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(value);
    let mut out = Vec::with_capacity(value.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Expiry sweeper
// ---------------------------------------------------------------------------

/// Spawn a task that calls [`Engine::sweep_expired`] every `interval` until
/// `shutdown` flips to `true`.
pub fn spawn_sweeper(
    engine: Arc<dyn Engine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(?interval, "expiry sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match engine.sweep_expired().await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(removed, "expired entries swept"),
                        Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("expiry sweeper stopped");
    })
}

// ---------------------------------------------------------------------------
// In-process connection
// ---------------------------------------------------------------------------

/// [`KvConnection`] that calls an [`Engine`] directly, without a socket.
#[derive(Clone)]
pub struct LocalConnection {
    engine: Arc<dyn Engine>,
    closed: Arc<AtomicBool>,
}

impl LocalConnection {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn bucket_handle(&self, bucket: String) -> Arc<dyn KeyValue> {
        Arc::new(LocalBucket {
            engine: Arc::clone(&self.engine),
            closed: Arc::clone(&self.closed),
            bucket,
        })
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        ensure_open(&self.closed)
    }
}

fn ensure_open(closed: &AtomicBool) -> BrokerResult<()> {
    if closed.load(Ordering::Acquire) {
        Err(BrokerError::ConnectionClosed)
    } else {
        Ok(())
    }
}

#[async_trait]
impl KvConnection for LocalConnection {
    async fn create_key_value(&self, config: BucketConfig) -> BrokerResult<Arc<dyn KeyValue>> {
        self.ensure_open()?;
        let status = self.engine.create_bucket(&config).await?;
        Ok(self.bucket_handle(status.name))
    }

    async fn key_value(&self, bucket: &str) -> BrokerResult<Arc<dyn KeyValue>> {
        self.ensure_open()?;
        let status = self.engine.bucket_status(bucket).await?;
        Ok(self.bucket_handle(status.name))
    }

    async fn delete_key_value(&self, bucket: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        self.engine.delete_bucket(bucket).await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("local broker connection closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// [`KeyValue`] handle produced by [`LocalConnection`].
struct LocalBucket {
    engine: Arc<dyn Engine>,
    closed: Arc<AtomicBool>,
    bucket: String,
}

#[async_trait]
impl KeyValue for LocalBucket {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, key: &str) -> BrokerResult<KvEntry> {
        ensure_open(&self.closed)?;
        self.engine.get(&self.bucket, key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> BrokerResult<u64> {
        ensure_open(&self.closed)?;
        self.engine.write(&self.bucket, key, value, WriteMode::Put).await
    }

    async fn create(&self, key: &str, value: &[u8]) -> BrokerResult<u64> {
        ensure_open(&self.closed)?;
        self.engine
            .write(&self.bucket, key, value, WriteMode::Create)
            .await
    }

    async fn update(&self, key: &str, value: &[u8], revision: u64) -> BrokerResult<u64> {
        ensure_open(&self.closed)?;
        self.engine
            .write(&self.bucket, key, value, WriteMode::Update { revision })
            .await
    }

    async fn delete(&self, key: &str) -> BrokerResult<()> {
        ensure_open(&self.closed)?;
        self.engine.remove(&self.bucket, key, false).await.map(|_| ())
    }

    async fn purge(&self, key: &str) -> BrokerResult<()> {
        ensure_open(&self.closed)?;
        self.engine.remove(&self.bucket, key, true).await.map(|_| ())
    }

    async fn keys(&self) -> BrokerResult<Vec<String>> {
        ensure_open(&self.closed)?;
        self.engine.keys(&self.bucket).await
    }

    async fn status(&self) -> BrokerResult<BucketStatus> {
        ensure_open(&self.closed)?;
        self.engine.bucket_status(&self.bucket).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
