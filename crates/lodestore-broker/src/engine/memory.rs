//! In-memory engine backed by [`moka`].
//!
//! Each bucket is a `moka::future::Cache` whose `time_to_live` is the bucket
//! TTL, so moka's own expiry ("from last insert or update") implements the
//! bucket-wide TTL.  Conditional writes go through moka's atomic
//! `and_compute_with` entry API.
//!
//! Reconfiguring a bucket's TTL rebuilds its cache; carried-over entries get
//! a fresh TTL clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use moka::ops::compute::Op;
use tracing::{debug, info, warn};

use super::{Engine, compress, decompress};
use crate::error::{BrokerError, BrokerResult};
use crate::kv::{
    BucketConfig, BucketStatus, KvEntry, Operation, WriteMode, validate_bucket, validate_key,
    validate_value,
};

#[derive(Clone)]
struct StoredEntry {
    value: Arc<Vec<u8>>,
    compressed: bool,
    revision: u64,
    operation: Operation,
    created: DateTime<Utc>,
}

struct MemoryBucket {
    config: BucketConfig,
    revision: AtomicU64,
    entries: Cache<String, StoredEntry>,
}

impl MemoryBucket {
    fn new(config: BucketConfig, revision: u64) -> Self {
        let mut builder = Cache::builder().name(&config.name);
        if !config.ttl.is_zero() {
            builder = builder.time_to_live(config.ttl);
        }
        Self {
            entries: builder.build(),
            revision: AtomicU64::new(revision),
            config,
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn status(&self) -> BucketStatus {
        let values = self
            .entries
            .iter()
            .filter(|(_, e)| e.operation == Operation::Put)
            .count() as u64;
        BucketStatus {
            name: self.config.name.clone(),
            ttl: self.config.ttl,
            compression: self.config.compression,
            values,
            revision: self.revision.load(Ordering::Acquire),
        }
    }
}

/// Volatile engine; buckets vanish when the engine is dropped.
#[derive(Default)]
pub struct MemoryEngine {
    buckets: DashMap<String, Arc<MemoryBucket>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, name: &str) -> BrokerResult<Arc<MemoryBucket>> {
        validate_bucket(name)?;
        self.buckets
            .get(name)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| BrokerError::BucketNotFound {
                bucket: name.to_owned(),
            })
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn create_bucket(&self, config: &BucketConfig) -> BrokerResult<BucketStatus> {
        validate_bucket(&config.name)?;

        let existing = self.buckets.get(&config.name).map(|b| Arc::clone(b.value()));
        let bucket = match existing {
            None => {
                let bucket = Arc::clone(
                    self.buckets
                        .entry(config.name.clone())
                        .or_insert_with(|| Arc::new(MemoryBucket::new(config.clone(), 0)))
                        .value(),
                );
                info!(
                    bucket = %config.name,
                    ttl = ?config.ttl,
                    compression = config.compression,
                    "bucket created"
                );
                bucket
            }
            Some(current) if current.config == *config => {
                debug!(bucket = %config.name, "attached to existing bucket");
                current
            }
            Some(current) => {
                let rebuilt = Arc::new(MemoryBucket::new(
                    config.clone(),
                    current.revision.load(Ordering::Acquire),
                ));
                let carried: Vec<(String, StoredEntry)> = current
                    .entries
                    .iter()
                    .map(|(key, entry)| ((*key).clone(), entry))
                    .collect();
                for (key, entry) in carried {
                    rebuilt.entries.insert(key, entry).await;
                }
                self.buckets
                    .insert(config.name.clone(), Arc::clone(&rebuilt));
                warn!(
                    bucket = %config.name,
                    old_ttl = ?current.config.ttl,
                    new_ttl = ?config.ttl,
                    old_compression = current.config.compression,
                    new_compression = config.compression,
                    "existing bucket reconfigured"
                );
                rebuilt
            }
        };

        Ok(bucket.status())
    }

    async fn bucket_status(&self, bucket: &str) -> BrokerResult<BucketStatus> {
        Ok(self.bucket(bucket)?.status())
    }

    async fn delete_bucket(&self, bucket: &str) -> BrokerResult<()> {
        validate_bucket(bucket)?;
        match self.buckets.remove(bucket) {
            Some((_, removed)) => {
                removed.entries.invalidate_all();
                info!(bucket = %bucket, "bucket deleted");
                Ok(())
            }
            None => Err(BrokerError::BucketNotFound {
                bucket: bucket.to_owned(),
            }),
        }
    }

    async fn get(&self, bucket: &str, key: &str) -> BrokerResult<KvEntry> {
        validate_key(key)?;
        let b = self.bucket(bucket)?;

        let Some(stored) = b.entries.get(key).await else {
            return Err(BrokerError::KeyNotFound {
                key: key.to_owned(),
            });
        };
        if stored.operation != Operation::Put {
            return Err(BrokerError::KeyDeleted {
                key: key.to_owned(),
            });
        }

        let value = if stored.compressed {
            decompress(&stored.value)?
        } else {
            stored.value.as_ref().clone()
        };

        Ok(KvEntry {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            value,
            revision: stored.revision,
            operation: stored.operation,
            created: stored.created,
        })
    }

    async fn write(
        &self,
        bucket: &str,
        key: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> BrokerResult<u64> {
        validate_key(key)?;
        validate_value(key, value)?;
        let b = self.bucket(bucket)?;

        let (stored, compressed) = if b.config.compression {
            (compress(value)?, true)
        } else {
            (value.to_vec(), false)
        };
        let stored = Arc::new(stored);

        let mut rejection: Option<BrokerError> = None;
        let mut assigned = 0u64;

        b.entries
            .entry(key.to_owned())
            .and_compute_with(|current| {
                let live = current
                    .map(|e| e.into_value())
                    .filter(|e| e.operation == Operation::Put);

                let allowed = match mode {
                    WriteMode::Put => true,
                    WriteMode::Create => live.is_none(),
                    WriteMode::Update { revision } => {
                        live.as_ref().is_some_and(|e| e.revision == revision)
                    }
                };

                let op = if allowed {
                    assigned = b.next_revision();
                    Op::Put(StoredEntry {
                        value: Arc::clone(&stored),
                        compressed,
                        revision: assigned,
                        operation: Operation::Put,
                        created: Utc::now(),
                    })
                } else {
                    rejection = Some(match mode {
                        WriteMode::Update { revision } => BrokerError::WrongLastRevision {
                            key: key.to_owned(),
                            expected: revision,
                        },
                        _ => BrokerError::KeyExists {
                            key: key.to_owned(),
                        },
                    });
                    Op::Nop
                };
                std::future::ready(op)
            })
            .await;

        if let Some(err) = rejection {
            return Err(err);
        }
        debug!(bucket = %bucket, key = %key, revision = assigned, ?mode, "entry written");
        Ok(assigned)
    }

    async fn remove(&self, bucket: &str, key: &str, purge: bool) -> BrokerResult<u64> {
        validate_key(key)?;
        let b = self.bucket(bucket)?;
        let operation = if purge {
            Operation::Purge
        } else {
            Operation::Delete
        };

        let mut assigned = 0u64;
        b.entries
            .entry(key.to_owned())
            .and_compute_with(|current| {
                let op = match current {
                    Some(_) => {
                        assigned = b.next_revision();
                        Op::Put(StoredEntry {
                            value: Arc::new(Vec::new()),
                            compressed: false,
                            revision: assigned,
                            operation,
                            created: Utc::now(),
                        })
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        if assigned == 0 {
            return Err(BrokerError::KeyNotFound {
                key: key.to_owned(),
            });
        }
        debug!(bucket = %bucket, key = %key, revision = assigned, op = operation.as_str(), "entry removed");
        Ok(assigned)
    }

    async fn keys(&self, bucket: &str) -> BrokerResult<Vec<String>> {
        let b = self.bucket(bucket)?;
        let mut keys: Vec<String> = b
            .entries
            .iter()
            .filter(|(_, e)| e.operation == Operation::Put)
            .map(|(k, _)| (*k).clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn sweep_expired(&self) -> BrokerResult<u64> {
        let buckets: Vec<Arc<MemoryBucket>> =
            self.buckets.iter().map(|b| Arc::clone(b.value())).collect();
        let mut removed = 0u64;
        for bucket in buckets {
            let before = bucket.entries.entry_count();
            bucket.entries.run_pending_tasks().await;
            removed += before.saturating_sub(bucket.entries.entry_count());
        }
        Ok(removed)
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine_with(config: BucketConfig) -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.create_bucket(&config).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn create_then_conflict() {
        let engine = engine_with(BucketConfig::new("cache")).await;
        let rev = engine
            .write("cache", "1", b"widget", WriteMode::Create)
            .await
            .unwrap();
        assert_eq!(rev, 1);

        let err = engine
            .write("cache", "1", b"other", WriteMode::Create)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::KeyExists { .. }));
        assert_eq!(engine.get("cache", "1").await.unwrap().value(), b"widget");
    }

    #[tokio::test]
    async fn delete_then_get_reports_deleted() {
        let engine = engine_with(BucketConfig::new("sessions")).await;
        engine
            .write("sessions", "tok", b"x", WriteMode::Put)
            .await
            .unwrap();
        engine.remove("sessions", "tok", true).await.unwrap();

        assert!(matches!(
            engine.get("sessions", "tok").await,
            Err(BrokerError::KeyDeleted { .. })
        ));
        assert!(engine.keys("sessions").await.unwrap().is_empty());
        assert!(matches!(
            engine.remove("sessions", "never", true).await,
            Err(BrokerError::KeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn update_requires_matching_revision() {
        let engine = engine_with(BucketConfig::new("cache")).await;
        let rev = engine.write("cache", "k", b"1", WriteMode::Put).await.unwrap();
        engine
            .write("cache", "k", b"2", WriteMode::Update { revision: rev })
            .await
            .unwrap();
        assert!(matches!(
            engine
                .write("cache", "k", b"3", WriteMode::Update { revision: rev })
                .await,
            Err(BrokerError::WrongLastRevision { .. })
        ));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let config = BucketConfig::new("short").with_ttl(Duration::from_millis(50));
        let engine = engine_with(config).await;
        engine.write("short", "k", b"v", WriteMode::Put).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            engine.get("short", "k").await,
            Err(BrokerError::KeyNotFound { .. })
        ));
        engine
            .write("short", "k", b"v2", WriteMode::Create)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn compression_is_transparent() {
        let config = BucketConfig::new("packed").with_compression(true);
        let engine = engine_with(config).await;
        let value = b"abc".repeat(500);
        engine.write("packed", "k", &value, WriteMode::Put).await.unwrap();
        assert_eq!(engine.get("packed", "k").await.unwrap().value(), &value[..]);
    }

    #[tokio::test]
    async fn reconfigure_keeps_entries_and_revision() {
        let engine = engine_with(BucketConfig::new("cache")).await;
        engine.write("cache", "k", b"v", WriteMode::Put).await.unwrap();

        let status = engine
            .create_bucket(&BucketConfig::new("cache").with_ttl(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(status.ttl, Duration::from_secs(30));
        assert_eq!(status.revision, 1);
        assert_eq!(engine.get("cache", "k").await.unwrap().value(), b"v");
    }

    #[tokio::test]
    async fn concurrent_creates_have_one_winner() {
        let engine = Arc::new(engine_with(BucketConfig::new("cache")).await);
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.write("cache", "race", &[i], WriteMode::Create).await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(BrokerError::KeyExists { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
    }
}
