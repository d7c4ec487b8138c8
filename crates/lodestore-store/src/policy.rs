//! Per-bucket write policy.

use std::fmt;
use std::str::FromStr;

use lodestore_broker::{BrokerError, BrokerResult, KeyValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How an adapter writes a value whose key may already hold one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// Create if absent, overwrite if present.  Concurrent writers converge.
    #[default]
    Upsert,
    /// Create if absent; a live value yields `KeyExists`.
    CreateOnly,
}

impl WritePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::CreateOnly => "create-only",
        }
    }

    /// Write `value` under `key` according to the policy; returns the
    /// revision the bucket assigned.
    pub async fn write(self, kv: &dyn KeyValue, key: &str, value: &[u8]) -> BrokerResult<u64> {
        match kv.create(key, value).await {
            Err(BrokerError::KeyExists { .. }) if self == Self::Upsert => {
                debug!(bucket = kv.bucket(), "key exists, overwriting");
                kv.put(key, value).await
            }
            other => other,
        }
    }
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upsert" => Ok(Self::Upsert),
            "create-only" | "create_only" | "createonly" => Ok(Self::CreateOnly),
            other => Err(format!(
                "unknown write policy {other:?} (expected \"upsert\" or \"create-only\")"
            )),
        }
    }
}
