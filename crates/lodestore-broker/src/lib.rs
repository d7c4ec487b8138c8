//! Lodestore embedded broker.
//!
//! This crate provides the key-value broker the Lodestore service runs
//! in-process:
//!
//! - **[`kv`]** -- Bucket/key capability traits ([`KvConnection`],
//!   [`KeyValue`]) and their data types.
//! - **[`engine`]** -- Storage engines: SQLite-backed [`DurableEngine`] and
//!   moka-backed [`MemoryEngine`], plus the expiry sweeper.
//! - **[`protocol`]** -- Length-prefixed JSON frames spoken over TCP.
//! - **[`server`]** -- Accept loop serving the protocol from an engine.
//! - **[`client`]** -- Multiplexed TCP client implementing [`KvConnection`].
//! - **[`lifecycle`]** -- Supervised start/ready/shutdown state machine and
//!   the [`EmbeddedBroker`] implementations.
//! - **[`error`]** -- Unified broker error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod client;
pub mod engine;
pub mod error;
pub mod kv;
pub mod lifecycle;
pub mod protocol;
pub mod server;

// Re-export the most commonly used types at the crate root for convenience.
pub use client::BrokerClient;
pub use engine::{DurableEngine, Engine, LocalConnection, MemoryEngine};
pub use error::{BrokerError, BrokerResult};
pub use kv::{BucketConfig, BucketStatus, KeyValue, KvConnection, KvEntry, Operation, WriteMode};
pub use lifecycle::{
    BrokerHandle, BrokerOptions, BrokerState, EmbeddedBroker, InMemoryBroker, TcpBroker,
    start_broker, start_embedded,
};
