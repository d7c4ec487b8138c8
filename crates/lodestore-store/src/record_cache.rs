//! Cache-aside item store.
//!
//! Reads consult the cache bucket first and fall back to the
//! [`ItemRepository`] on a miss.  Writes go to the repository first and are
//! then mirrored into the cache:
//!
//! ```text
//!   create ─► repo.insert ─► cache (bucket WritePolicy, create-only by default)
//!   get    ─► cache ──hit──► item
//!               └──miss──► repo.find ─► [optional upsert back into cache]
//!   update ─► repo.update ─► cache.put (last writer wins)
//! ```
//!
//! Only "absent" and "deleted" count as a miss.  Any other cache failure is
//! returned to the caller rather than masked by a repository read.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lodestore_broker::KeyValue;
use lodestore_broker::kv::validate_key;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::{StoreError, StoreResult};
use crate::items::{Item, ItemRepository};
use crate::policy::WritePolicy;

// ── stats ────────────────────────────────────────────────────────────

/// Hit/miss counters of the cache bucket.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Between 0.0 and 1.0; 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            hit_rate: self.hit_rate(),
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.hit_rate() * 100.0
        )
    }
}

// ── store ────────────────────────────────────────────────────────────

/// Item store combining a system of record with a cache bucket.
#[derive(Clone)]
pub struct CachedItemStore {
    repo: Arc<dyn ItemRepository>,
    kv: Arc<dyn KeyValue>,
    prefix: String,
    policy: WritePolicy,
    repopulate_on_miss: bool,
    stats: Arc<CacheStats>,
}

impl CachedItemStore {
    /// Store with no key prefix, create-only cache writes, and no
    /// repopulation on miss.
    pub fn new(repo: Arc<dyn ItemRepository>, kv: Arc<dyn KeyValue>) -> Self {
        Self {
            repo,
            kv,
            prefix: String::new(),
            policy: WritePolicy::CreateOnly,
            repopulate_on_miss: false,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Policy applied to cache writes on create.
    pub fn with_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Write repository hits back into the cache after a miss.
    pub fn with_repopulate_on_miss(mut self, repopulate: bool) -> Self {
        self.repopulate_on_miss = repopulate;
        self
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn key(&self, id: &str) -> String {
        format!("{}{id}", self.prefix)
    }

    /// Cache key for a caller-supplied ID.  An ID that cannot form a valid
    /// key was never stored, so it is reported as `NotFound`.
    fn lookup_key(&self, id: &str) -> StoreResult<String> {
        let key = self.key(id);
        validate_key(&key).map_err(|_| StoreError::NotFound {
            entity: "item",
            id: id.to_owned(),
        })?;
        Ok(key)
    }

    /// Insert a new item and cache it.  A cache collision under the
    /// create-only policy is returned as `KeyExists`; the repository row is
    /// kept.
    #[instrument(skip(self), fields(bucket = self.kv.bucket()))]
    pub async fn create(&self, name: &str) -> StoreResult<Item> {
        let name = validate_name(name)?;
        let id = self.repo.insert(name).await?;
        let item = Item {
            id,
            name: name.to_owned(),
        };

        let body = serde_json::to_vec(&item)?;
        self.policy
            .write(self.kv.as_ref(), &self.key(&item.id), &body)
            .await?;
        debug!(id = %item.id, "item created and cached");
        Ok(item)
    }

    #[instrument(skip(self), fields(bucket = self.kv.bucket()))]
    pub async fn get(&self, id: &str) -> StoreResult<Item> {
        let key = self.lookup_key(id)?;
        match self.kv.get(&key).await {
            Ok(entry) => {
                self.stats.record_hit();
                debug!("cache hit");
                return Ok(serde_json::from_slice(entry.value())?);
            }
            Err(e) if e.is_not_found() => {
                self.stats.record_miss();
                debug!(reason = %e, "cache miss");
            }
            Err(e) => return Err(e.into()),
        }

        let item = self.repo.find(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "item",
            id: id.to_owned(),
        })?;

        if self.repopulate_on_miss {
            let body = serde_json::to_vec(&item)?;
            WritePolicy::Upsert.write(self.kv.as_ref(), &key, &body).await?;
            debug!("cache repopulated");
        }
        Ok(item)
    }

    /// Update the repository, then overwrite the cached copy.
    #[instrument(skip(self), fields(bucket = self.kv.bucket(), id = %item.id))]
    pub async fn update(&self, item: Item) -> StoreResult<Item> {
        let item = Item {
            name: validate_name(&item.name)?.to_owned(),
            ..item
        };
        let key = self.lookup_key(&item.id)?;
        if !self.repo.update(&item).await? {
            return Err(StoreError::NotFound {
                entity: "item",
                id: item.id,
            });
        }

        let body = serde_json::to_vec(&item)?;
        self.kv.put(&key, &body).await?;
        debug!("item updated and cached");
        Ok(item)
    }
}

fn validate_name(name: &str) -> StoreResult<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        Err(StoreError::InvalidArgument("item name must not be empty".into()))
    } else {
        Ok(trimmed)
    }
}

// ── tests ────────────────────────────────────────────────────────────
