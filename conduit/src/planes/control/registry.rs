use crate::domain::response::InvalidateResponse;
use crate::domain::{CacheConfig, CacheScope, MemoConfig};
use crate::events::{CacheEvent, EventSink};
use crate::persistence::{PersistedRecord, namespace_prefix, storage_key};
use crate::planes::control::operation::CacheManagement;
use crate::planes::data::cached::CacheBinding;
use crate::planes::data::dedup::Deduplicator;
use crate::planes::data::memo::Memoizer;
use crate::planes::data::queue::QueueSerializer;
use crate::ports::{CacheStore, MemoControl, PersistenceBackend, StoreControl, StoreHandle};
use crate::store::TtlStore;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use shared::config::Config;
use shared::{Error, Result};
use std::any::Any;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

type AnyArc = Arc<dyn Any + Send + Sync>;

enum Registration {
    /// Named store owned by the registry
    Shared(Arc<dyn StoreControl>),
    /// Private store owned by one wrapper; gone once the wrapper is dropped
    Private(Weak<dyn StoreControl>),
}

struct RegisteredStore {
    // `Arc<dyn CacheStore<T>>` for shared stores
    typed: Option<AnyArc>,
    registration: Registration,
    persistent: bool,
    // `None` for stores registered through `register_store`
    max_entries: Option<Option<usize>>,
}

impl RegisteredStore {
    fn control(&self) -> Option<Arc<dyn StoreControl>> {
        match &self.registration {
            Registration::Shared(control) => Some(Arc::clone(control)),
            Registration::Private(weak) => weak.upgrade(),
        }
    }
}

struct RegisteredMemo {
    typed: AnyArc,
    control: Arc<dyn MemoControl>,
}

struct RegistryInner {
    config: Config,
    caches: DashMap<String, RegisteredStore>,
    // Cache misses coalesce apart from `deduplicated` wrappers, which may sit
    // underneath a cache of the same name
    cache_dedups: DashMap<String, AnyArc>,
    dedups: DashMap<String, AnyArc>,
    memoizers: DashMap<String, RegisteredMemo>,
    queues: Arc<QueueSerializer>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    events: EventSink,
    next_private: AtomicU64,
}

/// Owner of every cache, deduplicator, memoizer and queue created through it.
///
/// Cloning is cheap and clones share state. Dropping the last clone drops the
/// shared stores and queues; wrappers keep what they already hold alive.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
pub struct RegistryBuilder {
    config: Config,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    event_capacity: Option<usize>,
}

impl RegistryBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Backend for persistent-scope caches
    pub fn persistence(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.persistence = Some(backend);
        self
    }

    /// Broadcast cache events to subscribers, buffering up to `capacity`
    pub fn events(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Registry {
        let events = match self.event_capacity {
            Some(capacity) => EventSink::with_capacity(capacity),
            None => EventSink::disabled(),
        };
        info!(
            persistence = self.persistence.is_some(),
            events = self.event_capacity.is_some(),
            "Registry created"
        );

        Registry {
            inner: Arc::new(RegistryInner {
                config: self.config,
                caches: DashMap::new(),
                cache_dedups: DashMap::new(),
                dedups: DashMap::new(),
                memoizers: DashMap::new(),
                queues: Arc::new(QueueSerializer::new()),
                persistence: self.persistence,
                events,
                next_private: AtomicU64::new(0),
            }),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn persistence(&self) -> Option<&Arc<dyn PersistenceBackend>> {
        self.inner.persistence.as_ref()
    }

    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    /// `None` when the registry was built without events
    pub fn subscribe(&self) -> Option<broadcast::Receiver<CacheEvent>> {
        self.inner.events.subscribe()
    }

    pub fn queues(&self) -> Arc<QueueSerializer> {
        Arc::clone(&self.inner.queues)
    }

    /// Resolve where a cached operation configured by `config` keeps its entries.
    ///
    /// Memory scope gets a private store; session and persistent scope share
    /// the store registered under the cache name.
    pub fn cache_binding<T, E>(&self, config: &CacheConfig) -> Result<CacheBinding<T, E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        config.validate()?;
        let persistence = match config.scope {
            CacheScope::Persistent => Some(self.inner.persistence.clone().ok_or_else(|| {
                Error::configuration(format!(
                    "cache '{}' uses persistent scope but the registry has no persistence backend",
                    config.name
                ))
            })?),
            CacheScope::Memory | CacheScope::Session => None,
        };

        if config.scope == CacheScope::Memory {
            let id = self.inner.next_private.fetch_add(1, Ordering::Relaxed);
            let namespace = format!("{}#{}", config.name, id);
            let store: Arc<dyn CacheStore<T>> = Arc::new(self.new_store(&namespace, config.max_cache_size));
            let control: Arc<dyn StoreControl> = Arc::new(StoreHandle(Arc::clone(&store)));
            self.inner.caches.insert(
                namespace.clone(),
                RegisteredStore {
                    typed: None,
                    registration: Registration::Private(Arc::downgrade(&control)),
                    persistent: false,
                    max_entries: Some(config.max_cache_size),
                },
            );
            debug!(namespace = %namespace, "Registered private cache");

            return Ok(CacheBinding {
                dedup: Arc::new(Deduplicator::new(namespace.clone())),
                namespace,
                store,
                persistence: None,
                events: self.inner.events.clone(),
                _registration: Some(control),
            });
        }

        let namespace = config.name.clone();
        let persistent = config.scope == CacheScope::Persistent;
        let store = match self.inner.caches.entry(namespace.clone()) {
            Entry::Occupied(mut occupied) => {
                let registered = occupied.get_mut();
                let store = downcast_store::<T>(&namespace, registered.typed.as_ref())?;
                match registered.max_entries {
                    Some(existing) if existing != config.max_cache_size => {
                        return Err(Error::configuration(format!(
                            "cache '{}' is already registered with max size {:?}, not {:?}",
                            namespace, existing, config.max_cache_size
                        )));
                    }
                    None if config.max_cache_size.is_some() => {
                        warn!(namespace = %namespace, "Ignoring max_cache_size for an externally registered store");
                    }
                    _ => {}
                }
                registered.persistent |= persistent;
                store
            }
            Entry::Vacant(vacant) => {
                let store: Arc<dyn CacheStore<T>> =
                    Arc::new(self.new_store(&namespace, config.max_cache_size));
                vacant.insert(RegisteredStore {
                    typed: Some(Arc::new(Arc::clone(&store))),
                    registration: Registration::Shared(Arc::new(StoreHandle(Arc::clone(&store)))),
                    persistent,
                    max_entries: Some(config.max_cache_size),
                });
                info!(namespace = %namespace, scope = ?config.scope, "Registered shared cache");
                store
            }
        };

        Ok(CacheBinding {
            dedup: shared_deduplicator(&self.inner.cache_dedups, &namespace)?,
            namespace,
            store,
            persistence,
            events: self.inner.events.clone(),
            _registration: None,
        })
    }

    /// Register a caller-built store under `namespace` for session-scope use
    pub fn register_store<T>(&self, namespace: &str, store: Arc<dyn CacheStore<T>>) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.inner.caches.entry(namespace.to_string()) {
            Entry::Occupied(_) => Err(Error::configuration(format!(
                "cache '{}' is already registered",
                namespace
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(RegisteredStore {
                    typed: Some(Arc::new(Arc::clone(&store))),
                    registration: Registration::Shared(Arc::new(StoreHandle(store))),
                    persistent: false,
                    max_entries: None,
                });
                info!(namespace, "Registered external cache store");
                Ok(())
            }
        }
    }

    /// Shared store registered under `namespace`
    pub fn store<T>(&self, namespace: &str) -> Result<Arc<dyn CacheStore<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let registered = self
            .inner
            .caches
            .get(namespace)
            .ok_or_else(|| Error::CacheNotFound(namespace.to_string()))?;
        downcast_store::<T>(namespace, registered.typed.as_ref())
    }

    /// Deduplicator shared by every `deduplicated` wrapper using `namespace`.
    /// Caches coalesce their misses through deduplicators of their own.
    pub fn deduplicator<T, E>(&self, namespace: &str) -> Result<Arc<Deduplicator<T, E>>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        shared_deduplicator(&self.inner.dedups, namespace)
    }

    /// Memoizer shared by name; separate from the general caches
    pub fn memoizer<T, E>(&self, config: MemoConfig) -> Result<Arc<Memoizer<T, E>>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        config.validate()?;
        match self.inner.memoizers.entry(config.name.clone()) {
            Entry::Occupied(occupied) => Arc::clone(&occupied.get().typed)
                .downcast::<Memoizer<T, E>>()
                .map_err(|_| {
                    Error::configuration(format!(
                        "memoizer '{}' is used with different result types",
                        config.name
                    ))
                }),
            Entry::Vacant(vacant) => {
                let memo = Arc::new(Memoizer::<T, E>::new(config)?);
                vacant.insert(RegisteredMemo {
                    typed: memo.clone(),
                    control: memo.clone(),
                });
                Ok(memo)
            }
        }
    }

    /// Names of the shared caches
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .caches
            .iter()
            .filter(|registered| registered.typed.is_some())
            .map(|registered| registered.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Drop `key` from every cache, persisted copies included.
    /// Returns how many caches held it.
    pub async fn invalidate(&self, key: &str) -> usize {
        let mut invalidated = 0;
        for (namespace, control, persistent) in self.live_stores() {
            let mut found = control.invalidate(key).await;
            if persistent {
                found |= self.remove_persisted(&storage_key(&namespace, key)).await;
            }
            if found {
                invalidated += 1;
            }
        }
        debug!(key, invalidated, "Invalidated key");
        invalidated
    }

    /// Drop `key` from one named cache
    pub async fn invalidate_in(&self, namespace: &str, key: &str) -> Result<bool> {
        let (control, persistent) = {
            let registered = self
                .inner
                .caches
                .get(namespace)
                .ok_or_else(|| Error::CacheNotFound(namespace.to_string()))?;
            let control = registered
                .control()
                .ok_or_else(|| Error::CacheNotFound(namespace.to_string()))?;
            (control, registered.persistent)
        };

        let mut found = control.invalidate(key).await;
        if persistent {
            found |= self.remove_persisted(&storage_key(namespace, key)).await;
        }
        Ok(found)
    }

    /// Drop every entry tagged with `group`, whatever its TTL
    pub async fn invalidate_group(&self, group: &str) -> InvalidateResponse {
        let mut response = InvalidateResponse::default();
        for (namespace, control, persistent) in self.live_stores() {
            let in_memory = control.invalidate_group(group).await.invalidated;
            let persisted = if persistent {
                self.remove_persisted_group(&namespace, group).await
            } else {
                0
            };
            response = response.merge(InvalidateResponse::new(in_memory.max(persisted)));
        }
        info!(group, invalidated = response.invalidated, "Invalidated group");
        response
    }

    /// Empty every cache and its persisted copies. Memoizers are left alone.
    pub async fn clear_all(&self) -> InvalidateResponse {
        let mut response = InvalidateResponse::default();
        for (namespace, control, persistent) in self.live_stores() {
            let in_memory = control.clear().await.invalidated;
            let persisted = if persistent {
                self.remove_persisted_namespace(&namespace).await
            } else {
                0
            };
            response = response.merge(InvalidateResponse::new(in_memory.max(persisted)));
        }
        info!(cleared = response.invalidated, "Cleared all caches");
        response
    }

    /// Drop expired entries from every in-memory store
    pub async fn purge_expired(&self) -> InvalidateResponse {
        let mut response = InvalidateResponse::default();
        for (_, control, _) in self.live_stores() {
            response = response.merge(control.purge_expired().await);
        }
        debug!(purged = response.invalidated, "Purged expired entries");
        response
    }

    /// Forget every memoized result
    pub async fn clear_memoized(&self) -> usize {
        let controls: Vec<Arc<dyn MemoControl>> = self
            .inner
            .memoizers
            .iter()
            .map(|memo| Arc::clone(&memo.control))
            .collect();

        let mut cleared = 0;
        for control in controls {
            cleared += control.clear().await;
        }
        info!(cleared, "Cleared memoized results");
        cleared
    }

    pub async fn clear_memoizer(&self, name: &str) -> Result<usize> {
        let control = self
            .inner
            .memoizers
            .get(name)
            .map(|memo| Arc::clone(&memo.control))
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))?;
        Ok(control.clear().await)
    }

    /// Entries currently held across every in-memory store
    pub async fn total_entries(&self) -> usize {
        let mut total = 0;
        for (_, control, _) in self.live_stores() {
            total += control.len().await;
        }
        total
    }

    fn new_store<T>(&self, namespace: &str, max_entries: Option<usize>) -> TtlStore<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        TtlStore::with_events(namespace, max_entries, self.inner.events.clone())
    }

    /// Snapshot of live stores; forgets private stores whose wrapper is gone.
    /// No map guard is held once this returns.
    fn live_stores(&self) -> Vec<(String, Arc<dyn StoreControl>, bool)> {
        self.inner.caches.retain(|_, registered| match &registered.registration {
            Registration::Shared(_) => true,
            Registration::Private(weak) => weak.strong_count() > 0,
        });

        self.inner
            .caches
            .iter()
            .filter_map(|registered| {
                registered
                    .control()
                    .map(|control| (registered.key().clone(), control, registered.persistent))
            })
            .collect()
    }

    async fn remove_persisted(&self, storage_key: &str) -> bool {
        let Some(backend) = self.inner.persistence.as_ref() else {
            return false;
        };
        match backend.remove(storage_key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = storage_key, "Failed to remove persisted entry: {}", e);
                false
            }
        }
    }

    async fn remove_persisted_group(&self, namespace: &str, group: &str) -> usize {
        let Some(backend) = self.inner.persistence.as_ref() else {
            return 0;
        };
        let keys = match backend.keys_with_prefix(&namespace_prefix(namespace)).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(namespace, "Failed to list persisted entries: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            let in_group = match backend.get(&key).await {
                Ok(Some(text)) => PersistedRecord::<serde_json::Value>::decode(&text)
                    .map(|record| record.group.as_deref() == Some(group))
                    .unwrap_or(false),
                Ok(None) => false,
                Err(e) => {
                    warn!(key = %key, "Failed to read persisted entry: {}", e);
                    false
                }
            };
            if in_group && self.remove_persisted(&key).await {
                removed += 1;
            }
        }
        removed
    }

    async fn remove_persisted_namespace(&self, namespace: &str) -> usize {
        let Some(backend) = self.inner.persistence.as_ref() else {
            return 0;
        };
        let keys = match backend.keys_with_prefix(&namespace_prefix(namespace)).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(namespace, "Failed to list persisted entries: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            if self.remove_persisted(&key).await {
                removed += 1;
            }
        }
        removed
    }
}

#[async_trait]
impl CacheManagement for Registry {
    async fn invalidate(&self, key: &str) -> usize {
        Registry::invalidate(self, key).await
    }

    async fn invalidate_group(&self, group: &str) -> InvalidateResponse {
        Registry::invalidate_group(self, group).await
    }

    async fn clear_all(&self) -> InvalidateResponse {
        Registry::clear_all(self).await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("caches", &self.inner.caches.len())
            .field("memoizers", &self.inner.memoizers.len())
            .field("persistence", &self.inner.persistence.is_some())
            .finish()
    }
}

fn shared_deduplicator<T, E>(
    dedups: &DashMap<String, AnyArc>,
    namespace: &str,
) -> Result<Arc<Deduplicator<T, E>>>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let any = Arc::clone(
        dedups
            .entry(namespace.to_string())
            .or_insert_with(|| -> AnyArc { Arc::new(Deduplicator::<T, E>::new(namespace)) })
            .value(),
    );
    any.downcast::<Deduplicator<T, E>>().map_err(|_| {
        Error::configuration(format!(
            "deduplicator '{}' is used with different result types",
            namespace
        ))
    })
}

fn downcast_store<T>(namespace: &str, typed: Option<&AnyArc>) -> Result<Arc<dyn CacheStore<T>>>
where
    T: Clone + Send + Sync + 'static,
{
    typed
        .and_then(|typed| typed.downcast_ref::<Arc<dyn CacheStore<T>>>())
        .cloned()
        .ok_or_else(|| {
            Error::configuration(format!(
                "cache '{}' is registered with a different value type",
                namespace
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyGenerator;
    use crate::persistence::MemoryBackend;
    use crate::planes::data::cached::Cached;
    use crate::ports::{OpFuture, Operation};
    use shared::TtlMs;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::time::{advance, sleep};

    fn lookup(calls: Arc<AtomicU32>) -> impl Fn(u32) -> OpFuture<String, Error> + Send + Sync + 'static {
        move |id: u32| -> OpFuture<String, Error> {
            let version = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move { Ok(format!("room-{}-v{}", id, version)) })
        }
    }

    fn cached_on(
        registry: &Registry,
        calls: &Arc<AtomicU32>,
        config: CacheConfig,
    ) -> Cached<impl Operation<u32, String, Error>, u32, String, Error> {
        let binding = registry.cache_binding(&config).unwrap();
        Cached::new(
            lookup(Arc::clone(calls)),
            KeyGenerator::serialized("room"),
            config,
            binding,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_scope_shares_entries_by_name() {
        let registry = Registry::new();
        let config = CacheConfig::new("rooms", TtlMs(1000)).scope(CacheScope::Session);
        let calls = Arc::new(AtomicU32::new(0));

        let first = cached_on(&registry, &calls, config.clone());
        let second = cached_on(&registry, &calls, config);

        first.call(1).await.unwrap();
        assert_eq!(second.call(1).await.unwrap(), "room-1-v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.cache_names(), vec!["rooms"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_scope_is_private_per_wrapper() {
        let registry = Registry::new();
        let config = CacheConfig::new("rooms", TtlMs(1000));
        let calls = Arc::new(AtomicU32::new(0));

        let first = cached_on(&registry, &calls, config.clone());
        let second = cached_on(&registry, &calls, config);

        first.call(1).await.unwrap();
        second.call(1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(first.namespace(), second.namespace());
        assert!(registry.cache_names().is_empty());

        // Private stores are still reachable through the management surface
        assert_eq!(registry.invalidate("room:1").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_private_store_is_forgotten() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let op = cached_on(&registry, &calls, CacheConfig::new("rooms", TtlMs(1000)));
        op.call(1).await.unwrap();
        assert_eq!(registry.total_entries().await, 1);

        drop(op);
        assert_eq!(registry.total_entries().await, 0);
        assert_eq!(registry.inner.caches.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_type_mismatch_is_a_configuration_error() {
        let registry = Registry::new();
        let config = CacheConfig::new("rooms", TtlMs(1000)).scope(CacheScope::Session);

        registry.cache_binding::<String, Error>(&config).unwrap();
        let mismatch = registry.cache_binding::<u64, Error>(&config);

        assert!(matches!(mismatch, Err(Error::Configuration(_))));
        assert!(matches!(registry.store::<u64>("rooms"), Err(Error::Configuration(_))));
        assert!(matches!(registry.store::<String>("absent"), Err(Error::CacheNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_expiring_entry_removed_by_group_invalidation() {
        let registry = Registry::new();
        let config = CacheConfig::new("rooms", TtlMs::NEVER)
            .scope(CacheScope::Session)
            .group("floor-2");
        let calls = Arc::new(AtomicU32::new(0));
        let op = cached_on(&registry, &calls, config);

        op.call(7).await.unwrap();
        advance(Duration::from_secs(30 * 24 * 3600)).await;
        let store = registry.store::<String>("rooms").unwrap();
        assert!(store.get("room:7").await.is_some());

        let response = registry.invalidate_group("floor-2").await;

        assert_eq!(response.invalidated, 1);
        assert!(store.get("room:7").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_invalidation_spans_caches() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let rooms = cached_on(
            &registry,
            &calls,
            CacheConfig::new("rooms", TtlMs(1000)).scope(CacheScope::Session).group("ward"),
        );
        let beds = cached_on(
            &registry,
            &calls,
            CacheConfig::new("beds", TtlMs(1000)).scope(CacheScope::Session).group("ward"),
        );
        let other = cached_on(
            &registry,
            &calls,
            CacheConfig::new("staff", TtlMs(1000)).scope(CacheScope::Session),
        );
        rooms.call(1).await.unwrap();
        beds.call(1).await.unwrap();
        other.call(1).await.unwrap();

        assert_eq!(registry.invalidate_group("ward").await.invalidated, 2);
        assert_eq!(registry.total_entries().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_leaves_memoizers() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let op = cached_on(
            &registry,
            &calls,
            CacheConfig::new("rooms", TtlMs(1000)).scope(CacheScope::Session),
        );
        op.call(1).await.unwrap();
        op.call(2).await.unwrap();

        let memo = registry.memoizer::<u32, Error>(MemoConfig::new("squares")).unwrap();
        memo.get_or_compute("sq:3", || -> OpFuture<u32, Error> { Box::pin(async { Ok(9) }) })
            .await
            .unwrap();

        assert_eq!(registry.clear_all().await.invalidated, 2);
        assert_eq!(registry.total_entries().await, 0);
        assert_eq!(memo.len().await, 1);

        assert_eq!(registry.clear_memoized().await, 1);
        assert!(memo.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memoizer_is_shared_by_name() {
        let registry = Registry::new();
        let first = registry.memoizer::<u32, Error>(MemoConfig::new("squares")).unwrap();
        let second = registry.memoizer::<u32, Error>(MemoConfig::new("squares")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let mismatch = registry.memoizer::<String, Error>(MemoConfig::new("squares"));
        assert!(matches!(mismatch, Err(Error::Configuration(_))));
        assert!(matches!(
            registry.clear_memoizer("absent").await,
            Err(Error::CacheNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_records_follow_management_calls() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = Registry::builder().persistence(backend.clone()).build();
        let calls = Arc::new(AtomicU32::new(0));
        let op = cached_on(
            &registry,
            &calls,
            CacheConfig::new("rooms", TtlMs(60_000))
                .scope(CacheScope::Persistent)
                .group("floor-1"),
        );

        op.call(1).await.unwrap();
        op.call(2).await.unwrap();
        op.call(3).await.unwrap();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(backend.len(), 3);

        assert_eq!(registry.invalidate("room:1").await, 1);
        assert_eq!(backend.get("rooms/room:1").await.unwrap(), None);

        assert!(registry.invalidate_in("rooms", "room:2").await.unwrap());
        assert_eq!(backend.len(), 1);

        assert_eq!(registry.invalidate_group("floor-1").await.invalidated, 1);
        assert!(backend.is_empty());
    }

    /// Memory backend whose writes take a while to land
    struct SlowBackend(MemoryBackend);

    #[async_trait]
    impl PersistenceBackend for SlowBackend {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: String) -> Result<()> {
            sleep(Duration::from_millis(5)).await;
            self.0.set(key, value).await
        }
        async fn remove(&self, key: &str) -> Result<bool> {
            self.0.remove(key).await
        }
        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            self.0.keys_with_prefix(prefix).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_entry_stays_gone_after_slow_write() {
        let backend = Arc::new(SlowBackend(MemoryBackend::new()));
        let registry = Registry::builder().persistence(backend.clone()).build();
        let calls = Arc::new(AtomicU32::new(0));
        let config = CacheConfig::new("rooms", TtlMs(60_000)).scope(CacheScope::Persistent);
        let op = cached_on(&registry, &calls, config.clone());

        assert_eq!(op.call(1).await.unwrap(), "room-1-v1");
        assert_eq!(registry.invalidate("room:1").await, 1);
        sleep(Duration::from_millis(20)).await;
        assert!(backend.0.is_empty());

        // A restart must not resurrect the invalidated value
        let restarted = Registry::builder().persistence(backend.clone()).build();
        let op = cached_on(&restarted, &calls, config);
        assert_eq!(op.call(1).await.unwrap(), "room-1-v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_removes_persisted_records() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = Registry::builder().persistence(backend.clone()).build();
        let calls = Arc::new(AtomicU32::new(0));
        let op = cached_on(
            &registry,
            &calls,
            CacheConfig::new("rooms", TtlMs(60_000)).scope(CacheScope::Persistent),
        );
        op.call(1).await.unwrap();
        sleep(Duration::from_millis(1)).await;

        assert_eq!(registry.clear_all().await.invalidated, 1);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_persistent_scope_without_backend_is_rejected() {
        let registry = Registry::new();
        let config = CacheConfig::new("rooms", TtlMs(1000)).scope(CacheScope::Persistent);
        let binding = registry.cache_binding::<String, Error>(&config);
        assert!(matches!(binding, Err(Error::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_across_caches() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let op = cached_on(
            &registry,
            &calls,
            CacheConfig::new("rooms", TtlMs(100)).scope(CacheScope::Session),
        );
        op.call(1).await.unwrap();
        op.call(2).await.unwrap();
        advance(Duration::from_millis(150)).await;

        assert_eq!(registry.purge_expired().await.invalidated, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_reach_subscribers() {
        let registry = Registry::builder().events(16).build();
        let mut events = registry.subscribe().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let op = cached_on(
            &registry,
            &calls,
            CacheConfig::new("rooms", TtlMs(1000)).scope(CacheScope::Session),
        );

        op.call(1).await.unwrap();
        op.call(1).await.unwrap();
        registry.invalidate("room:1").await;

        assert!(matches!(events.recv().await.unwrap(), CacheEvent::Miss(_)));
        assert!(matches!(events.recv().await.unwrap(), CacheEvent::Stored(_)));
        assert!(matches!(events.recv().await.unwrap(), CacheEvent::Hit(_)));
        assert!(matches!(events.recv().await.unwrap(), CacheEvent::Invalidated(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_management_through_trait_object() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let op = cached_on(
            &registry,
            &calls,
            CacheConfig::new("rooms", TtlMs(1000)).scope(CacheScope::Session),
        );
        op.call(1).await.unwrap();

        let management: Arc<dyn CacheManagement> = Arc::new(registry.clone());
        assert_eq!(management.invalidate("room:1").await, 1);
        assert_eq!(management.clear_all().await.invalidated, 0);
    }

    #[test]
    fn test_shared_cache_rejects_different_size_bound() {
        let registry = Registry::new();
        let bounded = CacheConfig::new("rooms", TtlMs(1000))
            .scope(CacheScope::Session)
            .max_cache_size(10);

        registry.cache_binding::<String, Error>(&bounded).unwrap();
        registry.cache_binding::<String, Error>(&bounded).unwrap();

        let resized = bounded.clone().max_cache_size(20);
        let unbounded = CacheConfig::new("rooms", TtlMs(1000)).scope(CacheScope::Session);
        assert!(matches!(
            registry.cache_binding::<String, Error>(&resized),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            registry.cache_binding::<String, Error>(&unbounded),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_cache_and_deduplicated_wrapper_do_not_share_a_deduplicator() {
        let registry = Registry::new();
        let config = CacheConfig::new("rooms", TtlMs(1000)).scope(CacheScope::Session);

        let binding = registry.cache_binding::<String, Error>(&config).unwrap();
        let dedup = registry.deduplicator::<String, Error>("rooms").unwrap();

        assert!(!Arc::ptr_eq(&binding.dedup, &dedup));
        let again = registry.cache_binding::<String, Error>(&config).unwrap();
        assert!(Arc::ptr_eq(&binding.dedup, &again.dedup));
    }

    #[test]
    fn test_register_external_store() {
        let registry = Registry::new();
        let store: Arc<dyn CacheStore<String>> = Arc::new(TtlStore::bounded("external", 8));

        registry.register_store("external", Arc::clone(&store)).unwrap();

        assert!(registry.register_store("external", store).is_err());
        assert!(registry.store::<String>("external").is_ok());
    }
}
