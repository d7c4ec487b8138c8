//! Durable session store.
//!
//! [`SessionStore`] is the capability session middleware consumes: commit a
//! serialized session under its token, find it again, delete it.
//! [`KvSessionStore`] implements it over one broker bucket; session lifetime
//! is governed by the bucket TTL, so the per-entry expiry callers pass is
//! accepted and ignored.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestore_broker::{BrokerError, KeyValue};
use tracing::{debug, instrument};

use crate::error::{StoreError, StoreResult};
use crate::policy::WritePolicy;

/// Key prefix applied when none is configured.
pub const DEFAULT_SESSION_PREFIX: &str = "scs";

/// Storage capability for session middleware.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist `blob` under `token`.
    async fn commit(&self, token: &str, blob: &[u8], expiry: DateTime<Utc>) -> StoreResult<()>;

    /// The blob stored under `token`, or `None` if there is none.
    async fn find(&self, token: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Forget `token`.  Unknown tokens are not an error.
    async fn delete(&self, token: &str) -> StoreResult<()>;

    /// Every live session as `(token, blob)` pairs.
    async fn all(&self) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Err(StoreError::UnsupportedOperation("all"))
    }
}

/// [`SessionStore`] backed by a broker bucket.
#[derive(Clone)]
pub struct KvSessionStore {
    kv: Arc<dyn KeyValue>,
    prefix: String,
    policy: WritePolicy,
}

impl KvSessionStore {
    /// Store over `kv` with the default prefix and the upsert policy.
    pub fn new(kv: Arc<dyn KeyValue>) -> Self {
        Self {
            kv,
            prefix: DEFAULT_SESSION_PREFIX.to_owned(),
            policy: WritePolicy::Upsert,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, token: &str) -> StoreResult<String> {
        if token.is_empty() {
            return Err(StoreError::InvalidArgument("session token is empty".into()));
        }
        Ok(format!("{}{token}", self.prefix))
    }
}

#[async_trait]
impl SessionStore for KvSessionStore {
    #[instrument(skip(self, token, blob, _expiry), fields(bucket = self.kv.bucket(), len = blob.len()))]
    async fn commit(&self, token: &str, blob: &[u8], _expiry: DateTime<Utc>) -> StoreResult<()> {
        let key = self.key(token)?;
        let revision = self.policy.write(self.kv.as_ref(), &key, blob).await?;
        debug!(revision, "session committed");
        Ok(())
    }

    #[instrument(skip(self, token), fields(bucket = self.kv.bucket()))]
    async fn find(&self, token: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = self.key(token)?;
        match self.kv.get(&key).await {
            Ok(entry) => Ok(Some(entry.into_value())),
            Err(e) if e.is_not_found() => {
                let deleted = matches!(e, BrokerError::KeyDeleted { .. });
                debug!(deleted, "session not found");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, token), fields(bucket = self.kv.bucket()))]
    async fn delete(&self, token: &str) -> StoreResult<()> {
        let key = self.key(token)?;
        match self.kv.purge(&key).await {
            Ok(()) => Ok(()),
            Err(BrokerError::KeyNotFound { .. }) => {
                debug!("delete of unknown session ignored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(bucket = self.kv.bucket()))]
    async fn all(&self) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut sessions = Vec::new();
        for key in self.kv.keys().await? {
            let Some(token) = key.strip_prefix(self.prefix.as_str()) else {
                continue;
            };
            match self.kv.get(&key).await {
                Ok(entry) => sessions.push((token.to_owned(), entry.into_value())),
                // Expired or deleted between listing and reading.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sessions)
    }
}
