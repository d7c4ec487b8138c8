//! # lodestore-store
//!
//! Storage adapters for Lodestore.
//!
//! Sessions and cached items live in broker buckets; items have a SQLite
//! system of record behind them.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────┬───────────────────────────────┐
//! │  KvSessionStore           │  CachedItemStore              │
//! │  (SessionStore, upsert)   │  (cache-aside, create-only)   │
//! ├───────────────────────────┴───────────────┬───────────────┤
//! │  broker bucket (KeyValue)                 │ ItemRepository│
//! │  ensure_bucket / WritePolicy              │ (SQLite)      │
//! └───────────────────────────────────────────┴───────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use lodestore_store::{ensure_bucket, BucketSettings, KvSessionStore};
//!
//! let kv = ensure_bucket(conn.as_ref(), &BucketSettings::new("sessions", ttl)).await?;
//! let sessions = KvSessionStore::new(kv).with_prefix("scs");
//! ```

pub mod bucket;
pub mod db;
pub mod error;
pub mod items;
pub mod migration;
pub mod policy;
pub mod record_cache;
pub mod session;

// ── re-exports ───────────────────────────────────────────────────────

pub use bucket::{BucketSettings, ensure_bucket};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use items::{Item, ItemRepository, SqliteItemRepository};
pub use policy::WritePolicy;
pub use record_cache::{CacheStats, CacheStatsSnapshot, CachedItemStore};
pub use session::{DEFAULT_SESSION_PREFIX, KvSessionStore, SessionStore};
