use crate::domain::CacheEntry;
use crate::domain::response::{InvalidateResponse, PutResponse};
use crate::events::{
    now_timestamp_ms, CacheEvent, ClearedEvent, EventSink, GroupInvalidatedEvent,
};
use crate::ports::CacheStore;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use shared::TtlMs;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::num::NonZeroUsize;
use tokio::time::Instant;

struct Inner<V> {
    // Least recently touched entry is popped first
    entries: LruCache<String, CacheEntry<V>>,
    groups: HashMap<String, HashSet<String>>,
}

impl<V> Inner<V> {
    fn new(max_entries: Option<usize>) -> Self {
        let entries = match max_entries.and_then(NonZeroUsize::new) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            entries,
            groups: HashMap::new(),
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.pop(key)?;
        if let Some(group) = &entry.group {
            self.leave_group(group, key);
        }
        Some(entry)
    }

    /// Drop the least recently touched entry, returning its key
    fn evict(&mut self) -> Option<String> {
        let (key, entry) = self.entries.pop_lru()?;
        if let Some(group) = &entry.group {
            self.leave_group(group, &key);
        }
        Some(key)
    }

    fn join_group(&mut self, group: &str, key: &str) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string());
    }

    fn leave_group(&mut self, group: &str, key: &str) {
        if let Some(members) = self.groups.get_mut(group) {
            members.remove(key);
            if members.is_empty() {
                self.groups.remove(group);
            }
        }
    }
}

/// In-memory TTL store with optional size bound and least-recently-touched eviction.
///
/// Reads, writes and touches all count as a touch for eviction purposes.
/// Every state change happens under one mutex, so a `set` and the eviction
/// it triggers are never interleaved with another writer.
pub struct TtlStore<V> {
    namespace: String,
    max_entries: Option<usize>,
    inner: Mutex<Inner<V>>,
    events: EventSink,
}

impl<V> TtlStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(namespace: impl Into<String>, max_entries: Option<usize>) -> Self {
        Self::with_events(namespace, max_entries, EventSink::disabled())
    }

    pub fn unbounded(namespace: impl Into<String>) -> Self {
        Self::new(namespace, None)
    }

    pub fn bounded(namespace: impl Into<String>, max_entries: usize) -> Self {
        Self::new(namespace, Some(max_entries))
    }

    pub fn with_events(
        namespace: impl Into<String>,
        max_entries: Option<usize>,
        events: EventSink,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            max_entries,
            inner: Mutex::new(Inner::new(max_entries)),
            events,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    fn lookup(&self, key: &str, include_expired: bool) -> Option<CacheEntry<V>> {
        let mut inner = self.inner.lock();
        let expired = inner.entries.peek(key)?.is_expired_at(Instant::now());

        if expired && !include_expired {
            inner.remove(key);
            tracing::debug!(namespace = %self.namespace, key, "Dropped expired entry");
            return None;
        }

        inner.entries.get(key).cloned()
    }

    fn insert(&self, key: &str, value: V, ttl: TtlMs, group: Option<&str>) -> PutResponse {
        let mut evicted = None;
        let created;
        {
            let mut inner = self.inner.lock();
            let entry = CacheEntry::new(key, value, ttl, group.map(str::to_string));

            created = inner.remove(key).is_none();
            if created {
                if let Some(max) = self.max_entries {
                    while inner.entries.len() >= max {
                        let Some(victim) = inner.evict() else {
                            break;
                        };
                        evicted = Some(victim);
                    }
                }
            }

            if let Some(group) = group {
                inner.join_group(group, key);
            }
            inner.entries.put(key.to_string(), entry);
        }

        if let Some(ref victim) = evicted {
            tracing::debug!(namespace = %self.namespace, key = %victim, "Evicted least recently used entry");
            self.events.emit(CacheEvent::evicted(&self.namespace, victim));
        }

        PutResponse::new(created, evicted)
    }
}

#[async_trait]
impl<V> CacheStore<V> for TtlStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        self.lookup(key, false)
    }

    async fn get_stale(&self, key: &str) -> Option<CacheEntry<V>> {
        self.lookup(key, true)
    }

    async fn set(&self, key: &str, value: V, ttl: TtlMs, group: Option<&str>) -> PutResponse {
        self.insert(key, value, ttl, group)
    }

    async fn touch(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.peek_mut(key) else {
            return false;
        };
        if entry.is_expired_at(Instant::now()) {
            return false;
        }
        entry.touch();
        inner.entries.promote(key);
        true
    }

    async fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            self.events.emit(CacheEvent::invalidated(&self.namespace, key));
        }
        removed
    }

    async fn invalidate_group(&self, group: &str) -> InvalidateResponse {
        let invalidated = {
            let mut inner = self.inner.lock();
            let members = inner.groups.remove(group).unwrap_or_default();
            members
                .iter()
                .filter(|key| inner.entries.pop(key.as_str()).is_some())
                .count()
        };

        if invalidated > 0 {
            tracing::debug!(namespace = %self.namespace, group, invalidated, "Invalidated cache group");
            self.events
                .emit(CacheEvent::GroupInvalidated(GroupInvalidatedEvent {
                    namespace: self.namespace.clone(),
                    group: group.to_string(),
                    invalidated,
                    timestamp: now_timestamp_ms(),
                }));
        }
        InvalidateResponse::new(invalidated)
    }

    async fn clear(&self) -> InvalidateResponse {
        let cleared = {
            let mut inner = self.inner.lock();
            let cleared = inner.entries.len();
            *inner = Inner::new(self.max_entries);
            cleared
        };

        self.events.emit(CacheEvent::Cleared(ClearedEvent {
            namespace: self.namespace.clone(),
            cleared,
            timestamp: now_timestamp_ms(),
        }));
        InvalidateResponse::new(cleared)
    }

    async fn purge_expired(&self) -> InvalidateResponse {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        InvalidateResponse::new(expired.len())
    }

    async fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl<V> Debug for TtlStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlStore")
            .field("namespace", &self.namespace)
            .field("max_entries", &self.max_entries)
            .field("entries", &self.inner.lock().entries.len())
            .finish()
    }
}
