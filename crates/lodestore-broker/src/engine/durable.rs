//! SQLite-backed durable engine.
//!
//! Buckets and their latest entry per key live in `<storage_dir>/kv.db`.
//! The connection sits behind an `Arc<Mutex<>>` and every operation runs on
//! the blocking pool via `tokio::task::spawn_blocking`; writes happen inside
//! a transaction, so a create-only write and its existence check are atomic.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use super::{Engine, compress, decompress};
use crate::error::{BrokerError, BrokerResult};
use crate::kv::{
    BucketConfig, BucketStatus, KvEntry, Operation, WriteMode, validate_bucket, validate_key,
    validate_value,
};

/// File name of the engine database inside the storage directory.
pub const DB_FILE: &str = "kv.db";

const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS kv_buckets (
        name        TEXT PRIMARY KEY,
        ttl_ms      INTEGER NOT NULL,
        compression BOOLEAN NOT NULL,
        revision    INTEGER NOT NULL DEFAULT 0,
        created_at  INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS kv_entries (
        bucket      TEXT NOT NULL REFERENCES kv_buckets(name) ON DELETE CASCADE,
        key         TEXT NOT NULL,
        value       BLOB NOT NULL,
        compressed  BOOLEAN NOT NULL,
        revision    INTEGER NOT NULL,
        operation   TEXT NOT NULL CHECK(operation IN ('put','delete','purge')),
        written_at  INTEGER NOT NULL,
        PRIMARY KEY (bucket, key)
    );
    CREATE INDEX IF NOT EXISTS idx_kv_entries_written ON kv_entries(written_at);
"#;

/// Durable, TTL-aware bucket store.
#[derive(Clone)]
pub struct DurableEngine {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl DurableEngine {
    /// Open (or create) the engine database inside `storage_dir`.
    ///
    /// Blocks briefly on file I/O; call it from `spawn_blocking` when inside
    /// the runtime.
    pub fn open(storage_dir: impl AsRef<Path>) -> BrokerResult<Self> {
        let dir = storage_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DB_FILE);
        info!(path = %path.display(), "opening durable kv engine");

        let conn = Connection::open(&path)?;
        Self::prepare(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Engine backed by an in-memory SQLite database; nothing survives drop.
    pub fn open_in_memory() -> BrokerResult<Self> {
        debug!("opening in-memory durable kv engine");
        let conn = Connection::open_in_memory()?;
        Self::prepare(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Location of the database file, if on disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn prepare(conn: &Connection) -> BrokerResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            info!(version = SCHEMA_VERSION, "kv engine schema applied");
        }
        Ok(())
    }

    async fn execute<F, T>(&self, f: F) -> BrokerResult<T>
    where
        F: FnOnce(&mut Connection) -> BrokerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| BrokerError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }
}

// ── row helpers ─────────────────────────────────────────────────────

struct BucketRow {
    ttl_ms: i64,
    compression: bool,
    revision: i64,
}

struct EntryRow {
    value: Vec<u8>,
    compressed: bool,
    revision: i64,
    operation: Operation,
    written_at: i64,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_to_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn is_expired(written_at: i64, ttl_ms: i64, now: i64) -> bool {
    ttl_ms > 0 && written_at.saturating_add(ttl_ms) <= now
}

fn load_bucket(conn: &Connection, bucket: &str) -> BrokerResult<BucketRow> {
    conn.query_row(
        "SELECT ttl_ms, compression, revision FROM kv_buckets WHERE name = ?1",
        params![bucket],
        |row| {
            Ok(BucketRow {
                ttl_ms: row.get(0)?,
                compression: row.get(1)?,
                revision: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| BrokerError::BucketNotFound {
        bucket: bucket.to_owned(),
    })
}

fn load_entry(conn: &Connection, bucket: &str, key: &str) -> BrokerResult<Option<EntryRow>> {
    let row = conn
        .query_row(
            "SELECT value, compressed, revision, operation, written_at \
             FROM kv_entries WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    row.map(|(value, compressed, revision, op, written_at)| {
        let operation = Operation::parse(&op).ok_or_else(|| {
            BrokerError::Protocol(format!("unknown operation {op:?} stored for key {key}"))
        })?;
        Ok(EntryRow {
            value,
            compressed,
            revision,
            operation,
            written_at,
        })
    })
    .transpose()
}

fn status_of(conn: &Connection, bucket: &str, now: i64) -> BrokerResult<BucketStatus> {
    let row = load_bucket(conn, bucket)?;
    let values: i64 = conn.query_row(
        "SELECT count(*) FROM kv_entries \
         WHERE bucket = ?1 AND operation = 'put' AND (?2 = 0 OR written_at + ?2 > ?3)",
        params![bucket, row.ttl_ms, now],
        |r| r.get(0),
    )?;

    Ok(BucketStatus {
        name: bucket.to_owned(),
        ttl: Duration::from_millis(row.ttl_ms.max(0) as u64),
        compression: row.compression,
        values: values.max(0) as u64,
        revision: row.revision.max(0) as u64,
    })
}

#[allow(clippy::too_many_arguments)]
fn store_entry(
    conn: &Connection,
    bucket: &str,
    key: &str,
    value: &[u8],
    compressed: bool,
    revision: i64,
    operation: Operation,
    now: i64,
) -> BrokerResult<()> {
    conn.execute(
        "UPDATE kv_buckets SET revision = ?2 WHERE name = ?1",
        params![bucket, revision],
    )?;
    conn.execute(
        "INSERT INTO kv_entries (bucket, key, value, compressed, revision, operation, written_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(bucket, key) DO UPDATE SET \
             value = excluded.value, compressed = excluded.compressed, \
             revision = excluded.revision, operation = excluded.operation, \
             written_at = excluded.written_at",
        params![
            bucket,
            key,
            value,
            compressed,
            revision,
            operation.as_str(),
            now
        ],
    )?;
    Ok(())
}

// ── engine impl ─────────────────────────────────────────────────────

#[async_trait]
impl Engine for DurableEngine {
    async fn create_bucket(&self, config: &BucketConfig) -> BrokerResult<BucketStatus> {
        validate_bucket(&config.name)?;
        let config = config.clone();

        self.execute(move |conn| {
            let ttl_ms = ttl_to_ms(config.ttl);
            let now = now_ms();
            let tx = conn.transaction()?;

            let existing = tx
                .query_row(
                    "SELECT ttl_ms, compression FROM kv_buckets WHERE name = ?1",
                    params![config.name],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)),
                )
                .optional()?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO kv_buckets (name, ttl_ms, compression, revision, created_at) \
                         VALUES (?1, ?2, ?3, 0, ?4)",
                        params![config.name, ttl_ms, config.compression, now],
                    )?;
                    info!(
                        bucket = %config.name,
                        ttl = ?config.ttl,
                        compression = config.compression,
                        "bucket created"
                    );
                }
                Some((ttl, compression)) if ttl == ttl_ms && compression == config.compression => {
                    debug!(bucket = %config.name, "attached to existing bucket");
                }
                Some((ttl, compression)) => {
                    tx.execute(
                        "UPDATE kv_buckets SET ttl_ms = ?2, compression = ?3 WHERE name = ?1",
                        params![config.name, ttl_ms, config.compression],
                    )?;
                    warn!(
                        bucket = %config.name,
                        old_ttl_ms = ttl,
                        new_ttl_ms = ttl_ms,
                        old_compression = compression,
                        new_compression = config.compression,
                        "existing bucket reconfigured"
                    );
                }
            }

            let status = status_of(&tx, &config.name, now)?;
            tx.commit()?;
            Ok(status)
        })
        .await
    }

    async fn bucket_status(&self, bucket: &str) -> BrokerResult<BucketStatus> {
        validate_bucket(bucket)?;
        let bucket = bucket.to_owned();
        self.execute(move |conn| status_of(conn, &bucket, now_ms()))
            .await
    }

    async fn delete_bucket(&self, bucket: &str) -> BrokerResult<()> {
        validate_bucket(bucket)?;
        let bucket = bucket.to_owned();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM kv_entries WHERE bucket = ?1", params![bucket])?;
            let removed = tx.execute("DELETE FROM kv_buckets WHERE name = ?1", params![bucket])?;
            if removed == 0 {
                return Err(BrokerError::BucketNotFound { bucket });
            }
            tx.commit()?;
            info!(bucket = %bucket, "bucket deleted");
            Ok(())
        })
        .await
    }

    async fn get(&self, bucket: &str, key: &str) -> BrokerResult<KvEntry> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let bucket = bucket.to_owned();
        let key = key.to_owned();

        self.execute(move |conn| {
            let meta = load_bucket(conn, &bucket)?;
            let entry = match load_entry(conn, &bucket, &key)? {
                Some(e) if !is_expired(e.written_at, meta.ttl_ms, now_ms()) => e,
                _ => return Err(BrokerError::KeyNotFound { key }),
            };
            if entry.operation != Operation::Put {
                return Err(BrokerError::KeyDeleted { key });
            }

            let value = if entry.compressed {
                decompress(&entry.value)?
            } else {
                entry.value
            };

            Ok(KvEntry {
                bucket,
                key,
                value,
                revision: entry.revision.max(0) as u64,
                operation: entry.operation,
                created: DateTime::from_timestamp_millis(entry.written_at).unwrap_or_default(),
            })
        })
        .await
    }

    async fn write(
        &self,
        bucket: &str,
        key: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> BrokerResult<u64> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        validate_value(key, value)?;
        let bucket = bucket.to_owned();
        let key = key.to_owned();
        let value = value.to_vec();

        self.execute(move |conn| {
            let now = now_ms();
            let tx = conn.transaction()?;
            let meta = load_bucket(&tx, &bucket)?;

            let live = load_entry(&tx, &bucket, &key)?.filter(|e| {
                e.operation == Operation::Put && !is_expired(e.written_at, meta.ttl_ms, now)
            });

            match mode {
                WriteMode::Put => {}
                WriteMode::Create => {
                    if live.is_some() {
                        return Err(BrokerError::KeyExists { key });
                    }
                }
                WriteMode::Update { revision } => match &live {
                    Some(e) if e.revision.max(0) as u64 == revision => {}
                    _ => {
                        return Err(BrokerError::WrongLastRevision {
                            key,
                            expected: revision,
                        });
                    }
                },
            }

            let stored = if meta.compression {
                compress(&value)?
            } else {
                value
            };
            let revision = meta.revision + 1;
            store_entry(
                &tx,
                &bucket,
                &key,
                &stored,
                meta.compression,
                revision,
                Operation::Put,
                now,
            )?;
            tx.commit()?;

            debug!(bucket = %bucket, key = %key, revision, ?mode, "entry written");
            Ok(revision as u64)
        })
        .await
    }

    async fn remove(&self, bucket: &str, key: &str, purge: bool) -> BrokerResult<u64> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let bucket = bucket.to_owned();
        let key = key.to_owned();

        self.execute(move |conn| {
            let now = now_ms();
            let tx = conn.transaction()?;
            let meta = load_bucket(&tx, &bucket)?;

            let present = load_entry(&tx, &bucket, &key)?
                .is_some_and(|e| !is_expired(e.written_at, meta.ttl_ms, now));
            if !present {
                return Err(BrokerError::KeyNotFound { key });
            }

            let operation = if purge {
                Operation::Purge
            } else {
                Operation::Delete
            };
            let revision = meta.revision + 1;
            store_entry(&tx, &bucket, &key, &[], false, revision, operation, now)?;
            tx.commit()?;

            debug!(bucket = %bucket, key = %key, revision, op = operation.as_str(), "entry removed");
            Ok(revision as u64)
        })
        .await
    }

    async fn keys(&self, bucket: &str) -> BrokerResult<Vec<String>> {
        validate_bucket(bucket)?;
        let bucket = bucket.to_owned();

        self.execute(move |conn| {
            let meta = load_bucket(conn, &bucket)?;
            let mut stmt = conn.prepare(
                "SELECT key FROM kv_entries \
                 WHERE bucket = ?1 AND operation = 'put' AND (?2 = 0 OR written_at + ?2 > ?3) \
                 ORDER BY key",
            )?;
            let keys = stmt
                .query_map(params![bucket, meta.ttl_ms, now_ms()], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn sweep_expired(&self) -> BrokerResult<u64> {
        self.execute(|conn| {
            let removed = conn.execute(
                "DELETE FROM kv_entries WHERE EXISTS ( \
                     SELECT 1 FROM kv_buckets b \
                     WHERE b.name = kv_entries.bucket \
                       AND b.ttl_ms > 0 \
                       AND kv_entries.written_at + b.ttl_ms <= ?1)",
                params![now_ms()],
            )?;
            Ok(removed as u64)
        })
        .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine_with(config: BucketConfig) -> DurableEngine {
        let engine = DurableEngine::open_in_memory().unwrap();
        engine.create_bucket(&config).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn put_then_get() {
        let engine = engine_with(BucketConfig::new("cache")).await;
        let rev = engine
            .write("cache", "1", b"widget", WriteMode::Put)
            .await
            .unwrap();
        assert_eq!(rev, 1);

        let entry = engine.get("cache", "1").await.unwrap();
        assert_eq!(entry.value(), b"widget");
        assert_eq!(entry.revision, 1);
        assert_eq!(entry.operation, Operation::Put);
    }

    #[tokio::test]
    async fn create_rejects_live_key() {
        let engine = engine_with(BucketConfig::new("cache")).await;
        engine
            .write("cache", "1", b"a", WriteMode::Create)
            .await
            .unwrap();

        let err = engine
            .write("cache", "1", b"b", WriteMode::Create)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::KeyExists { ref key } if key == "1"));

        // The original value is untouched.
        assert_eq!(engine.get("cache", "1").await.unwrap().value(), b"a");
    }

    #[tokio::test]
    async fn deleted_key_reports_deleted_and_accepts_create() {
        let engine = engine_with(BucketConfig::new("sessions")).await;
        engine
            .write("sessions", "tok", b"x", WriteMode::Put)
            .await
            .unwrap();
        engine.remove("sessions", "tok", false).await.unwrap();

        assert!(matches!(
            engine.get("sessions", "tok").await,
            Err(BrokerError::KeyDeleted { .. })
        ));

        engine
            .write("sessions", "tok", b"y", WriteMode::Create)
            .await
            .unwrap();
        assert_eq!(engine.get("sessions", "tok").await.unwrap().value(), b"y");
    }

    #[tokio::test]
    async fn purge_of_unknown_key_is_not_found() {
        let engine = engine_with(BucketConfig::new("sessions")).await;
        assert!(matches!(
            engine.remove("sessions", "ghost", true).await,
            Err(BrokerError::KeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn update_checks_revision() {
        let engine = engine_with(BucketConfig::new("cache")).await;
        let rev = engine
            .write("cache", "k", b"1", WriteMode::Put)
            .await
            .unwrap();

        let next = engine
            .write("cache", "k", b"2", WriteMode::Update { revision: rev })
            .await
            .unwrap();
        assert!(next > rev);

        let err = engine
            .write("cache", "k", b"3", WriteMode::Update { revision: rev })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::WrongLastRevision { expected, .. } if expected == rev));
    }

    #[tokio::test]
    async fn revisions_are_per_bucket_and_monotonic() {
        let engine = engine_with(BucketConfig::new("a")).await;
        engine.create_bucket(&BucketConfig::new("b")).await.unwrap();

        let r1 = engine.write("a", "k", b"1", WriteMode::Put).await.unwrap();
        let r2 = engine.write("a", "k", b"2", WriteMode::Put).await.unwrap();
        let r3 = engine.remove("a", "k", false).await.unwrap();
        let other = engine.write("b", "k", b"1", WriteMode::Put).await.unwrap();

        assert_eq!((r1, r2, r3), (1, 2, 3));
        assert_eq!(other, 1);
        assert_eq!(engine.bucket_status("a").await.unwrap().revision, 3);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let config = BucketConfig::new("short").with_ttl(Duration::from_millis(50));
        let engine = engine_with(config).await;
        engine
            .write("short", "k", b"v", WriteMode::Put)
            .await
            .unwrap();
        assert!(engine.get("short", "k").await.is_ok());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            engine.get("short", "k").await,
            Err(BrokerError::KeyNotFound { .. })
        ));
        assert!(engine.keys("short").await.unwrap().is_empty());

        // Expired entries can be created again.
        engine
            .write("short", "k", b"again", WriteMode::Create)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(engine.sweep_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rewrite_renews_ttl() {
        let config = BucketConfig::new("renew").with_ttl(Duration::from_millis(200));
        let engine = engine_with(config).await;
        engine.write("renew", "k", b"1", WriteMode::Put).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        engine.write("renew", "k", b"2", WriteMode::Put).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(engine.get("renew", "k").await.unwrap().value(), b"2");
    }

    #[tokio::test]
    async fn compressed_bucket_round_trips() {
        let config = BucketConfig::new("packed").with_compression(true);
        let engine = engine_with(config).await;
        let value = b"0123456789".repeat(100);
        engine
            .write("packed", "k", &value, WriteMode::Put)
            .await
            .unwrap();

        let stored_len: i64 = engine
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT length(value) FROM kv_entries WHERE key = 'k'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert!((stored_len as usize) < value.len());
        assert_eq!(engine.get("packed", "k").await.unwrap().value(), &value[..]);
    }

    #[tokio::test]
    async fn create_bucket_is_idempotent_and_reconciles() {
        let engine = DurableEngine::open_in_memory().unwrap();
        let first = engine
            .create_bucket(&BucketConfig::new("cache").with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        engine.write("cache", "k", b"v", WriteMode::Put).await.unwrap();

        let again = engine
            .create_bucket(&BucketConfig::new("cache").with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(again.ttl, first.ttl);
        assert_eq!(again.values, 1);

        let changed = engine
            .create_bucket(
                &BucketConfig::new("cache")
                    .with_ttl(Duration::from_secs(120))
                    .with_compression(true),
            )
            .await
            .unwrap();
        assert_eq!(changed.ttl, Duration::from_secs(120));
        assert!(changed.compression);

        // Values written before the switch stay readable.
        assert_eq!(engine.get("cache", "k").await.unwrap().value(), b"v");
    }

    #[tokio::test]
    async fn unknown_bucket_is_reported() {
        let engine = DurableEngine::open_in_memory().unwrap();
        assert!(matches!(
            engine.get("nope", "k").await,
            Err(BrokerError::BucketNotFound { .. })
        ));
        assert!(matches!(
            engine.delete_bucket("nope").await,
            Err(BrokerError::BucketNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = DurableEngine::open(dir.path()).unwrap();
            engine
                .create_bucket(&BucketConfig::new("sessions").with_ttl(Duration::from_secs(3600)))
                .await
                .unwrap();
            engine
                .write("sessions", "scstok-1", b"alice", WriteMode::Put)
                .await
                .unwrap();
            assert!(engine.path().unwrap().ends_with(DB_FILE));
        }

        let engine = DurableEngine::open(dir.path()).unwrap();
        let status = engine.bucket_status("sessions").await.unwrap();
        assert_eq!(status.ttl, Duration::from_secs(3600));
        assert_eq!(
            engine.get("sessions", "scstok-1").await.unwrap().value(),
            b"alice"
        );
    }
}
