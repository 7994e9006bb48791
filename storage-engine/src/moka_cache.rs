use async_trait::async_trait;
use conduit::domain::CacheEntry;
use conduit::domain::response::{InvalidateResponse, PutResponse};
use conduit::events::{CacheEvent, ClearedEvent, EventSink, GroupInvalidatedEvent, now_timestamp_ms};
use conduit::ports::CacheStore;
use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use shared::TtlMs;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Expires each entry after its own TTL; a zero TTL never expires
struct EntryExpiry;

impl<V> Expiry<String, CacheEntry<V>> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &CacheEntry<V>, _created_at: Instant) -> Option<Duration> {
        value.remaining_ttl()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining_ttl()
    }
}

/// Moka-backed cache store with per-entry TTL and an LRU size bound.
///
/// Moka evicts and expires asynchronously, so the size bound is approximate
/// until pending maintenance runs, and `PutResponse::evicted` is always `None`.
/// Size evictions are reported through the event sink instead.
pub struct MokaCacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    namespace: String,
    cache: Cache<String, CacheEntry<V>>,
    events: EventSink,
}

impl<V> MokaCacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(namespace: impl Into<String>, max_entries: Option<u64>) -> Self {
        Self::with_events(namespace, max_entries, EventSink::disabled())
    }

    pub fn with_events(namespace: impl Into<String>, max_entries: Option<u64>, events: EventSink) -> Self {
        let namespace = namespace.into();
        let mut builder = Cache::builder()
            .name(&namespace)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .support_invalidation_closures();

        if let Some(capacity) = max_entries {
            builder = builder.max_capacity(capacity);
        }

        let listener_events = events.clone();
        let listener_namespace = namespace.clone();
        let cache = builder
            .eviction_listener(move |key: Arc<String>, _entry, cause| {
                if cause == RemovalCause::Size {
                    listener_events.emit(CacheEvent::evicted(&listener_namespace, &key));
                }
            })
            .build();

        Self {
            namespace,
            cache,
            events,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Apply pending evictions and expirations
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// Entries that are still readable. Moka reclaims expired entries on a
    /// coarse timer, so `entry_count` can include entries past their deadline.
    fn live_count(&self) -> usize {
        self.cache.iter().filter(|(_, entry)| !entry.is_expired()).count()
    }
}

#[async_trait]
impl<V> CacheStore<V> for MokaCacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        // Moka runs on the wall clock; the entry's own deadline is authoritative
        self.cache.get(key).await.filter(|entry| !entry.is_expired())
    }

    /// Only entries moka has not reclaimed yet can be served stale
    async fn get_stale(&self, key: &str) -> Option<CacheEntry<V>> {
        self.cache.get(key).await
    }

    async fn set(&self, key: &str, value: V, ttl: TtlMs, group: Option<&str>) -> PutResponse {
        let created = !self.cache.contains_key(key);
        let entry = CacheEntry::new(key, value, ttl, group.map(str::to_string));
        self.cache.insert(key.to_string(), entry).await;
        PutResponse::new(created, None)
    }

    async fn touch(&self, key: &str) -> bool {
        match self.get(key).await {
            Some(mut entry) => {
                entry.touch();
                self.cache.insert(key.to_string(), entry).await;
                true
            }
            None => false,
        }
    }

    async fn invalidate(&self, key: &str) -> bool {
        let removed = self.cache.remove(key).await.is_some();
        if removed {
            self.events.emit(CacheEvent::invalidated(&self.namespace, key));
        }
        removed
    }

    async fn invalidate_group(&self, group: &str) -> InvalidateResponse {
        let members: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.group.as_deref() == Some(group))
            .map(|(key, _)| key)
            .collect();

        let mut invalidated = 0;
        for key in members {
            if self.cache.remove(key.as_str()).await.is_some() {
                invalidated += 1;
            }
        }

        if invalidated > 0 {
            debug!(namespace = %self.namespace, group, invalidated, "Invalidated cache group");
            self.events.emit(CacheEvent::GroupInvalidated(GroupInvalidatedEvent {
                namespace: self.namespace.clone(),
                group: group.to_string(),
                invalidated,
                timestamp: now_timestamp_ms(),
            }));
        }
        InvalidateResponse::new(invalidated)
    }

    async fn clear(&self) -> InvalidateResponse {
        let cleared = self.live_count();
        self.cache.invalidate_all();
        self.sync().await;

        self.events.emit(CacheEvent::Cleared(ClearedEvent {
            namespace: self.namespace.clone(),
            cleared,
            timestamp: now_timestamp_ms(),
        }));
        InvalidateResponse::new(cleared)
    }

    /// Counts only entries moka still served; those it already treats as
    /// expired are unreadable and are reclaimed without being counted
    async fn purge_expired(&self) -> InvalidateResponse {
        let expired: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key)
            .collect();

        let mut purged = 0;
        for key in expired {
            if self.cache.remove(key.as_str()).await.is_some() {
                purged += 1;
            }
        }

        if let Err(e) = self.cache.invalidate_entries_if(|_, entry| entry.is_expired()) {
            warn!(namespace = %self.namespace, "Failed to schedule expired entry removal: {}", e);
        }
        self.sync().await;
        InvalidateResponse::new(purged)
    }

    async fn len(&self) -> usize {
        self.live_count()
    }
}

impl<V> Debug for MokaCacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaCacheStore")
            .field("namespace", &self.namespace)
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}
