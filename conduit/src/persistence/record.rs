use crate::events::now_timestamp_ms;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::{Error, Result, TtlMs};

/// Flat text record written to the persistence backend for persistent-scope caches.
///
/// Timestamps are wall-clock milliseconds since the UNIX epoch so records stay
/// meaningful across process restarts. `expiresAt` is `null` for entries that
/// never expire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord<V> {
    pub value: V,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl<V> PersistedRecord<V> {
    pub fn new(value: V, ttl: TtlMs, group: Option<String>) -> Self {
        let timestamp = now_timestamp_ms();
        let expires_at = (!ttl.is_never()).then(|| {
            timestamp.saturating_add(i64::try_from(ttl.0).unwrap_or(i64::MAX))
        });
        Self {
            value,
            timestamp,
            group,
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(expires_at) if now_ms >= expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_timestamp_ms())
    }

    /// TTL left as of `now_ms`, for re-hydrating an in-memory entry
    pub fn remaining_ttl_at(&self, now_ms: i64) -> TtlMs {
        match self.expires_at {
            None => TtlMs::NEVER,
            // A zero TTL would mean "never", so clamp to the shortest real one
            Some(expires_at) => TtlMs(u64::try_from(expires_at.saturating_sub(now_ms)).unwrap_or(0).max(1)),
        }
    }

    pub fn remaining_ttl(&self) -> TtlMs {
        self.remaining_ttl_at(now_timestamp_ms())
    }
}

impl<V> PersistedRecord<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::from)
    }
}

/// Backend key for `key` of cache `namespace`
pub fn storage_key(namespace: &str, key: &str) -> String {
    format!("{}/{}", namespace, key)
}

/// Prefix shared by every backend key of cache `namespace`
pub fn namespace_prefix(namespace: &str) -> String {
    format!("{}/", namespace)
}
