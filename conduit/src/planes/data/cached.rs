use crate::domain::{CacheConfig, CacheScope};
use crate::events::{CacheEvent, EventSink, StoredEvent, now_timestamp_ms};
use crate::keys::KeyGenerator;
use crate::persistence::{PersistedRecord, storage_key};
use crate::planes::data::dedup::{Deduplicator, SharedResult};
use crate::ports::{CacheStore, OpFuture, Operation, PersistenceBackend, StoreControl};
use crate::store::TtlStore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shared::{Error, Result};
use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a cached operation needs from its owner: where entries live,
/// who coalesces misses, and where persistent entries are written.
pub struct CacheBinding<T, E>
where
    T: Clone + Send + Sync + 'static,
{
    pub namespace: String,
    pub store: Arc<dyn CacheStore<T>>,
    pub dedup: Arc<Deduplicator<T, E>>,
    pub persistence: Option<Arc<dyn PersistenceBackend>>,
    pub events: EventSink,
    // Keeps a private store registered for as long as the binding lives
    pub(crate) _registration: Option<Arc<dyn StoreControl>>,
}

impl<T, E> CacheBinding<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Binding with its own in-memory store, outside any registry
    pub fn standalone(namespace: impl Into<String>, max_entries: Option<usize>) -> Self {
        let namespace = namespace.into();
        Self {
            store: Arc::new(TtlStore::new(namespace.clone(), max_entries)),
            dedup: Arc::new(Deduplicator::new(namespace.clone())),
            namespace,
            persistence: None,
            events: EventSink::disabled(),
            _registration: None,
        }
    }

    pub fn with_persistence(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.persistence = Some(backend);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }
}

struct CacheCore<O, T, E>
where
    T: Clone + Send + Sync + 'static,
{
    inner: O,
    config: CacheConfig,
    binding: CacheBinding<T, E>,
}

impl<O, T, E> CacheCore<O, T, E>
where
    O: Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn namespace(&self) -> &str {
        &self.binding.namespace
    }

    async fn resolve<A>(self: Arc<Self>, key: String, args: A) -> std::result::Result<T, E>
    where
        O: Operation<A, T, E>,
        A: Send + 'static,
    {
        let store = &self.binding.store;
        let cached = if self.config.stale_while_revalidate {
            store.get_stale(&key).await
        } else {
            store.get(&key).await
        };

        if let Some(entry) = cached {
            if !entry.is_expired() {
                if self.config.sliding_expiration {
                    store.touch(&key).await;
                }
                debug!(namespace = %self.namespace(), key = %key, "Cache hit");
                self.binding.events.emit(CacheEvent::hit(self.namespace(), &key));
                return Ok(entry.value);
            }

            // Only stale-while-revalidate reads return expired entries
            debug!(namespace = %self.namespace(), key = %key, "Serving stale entry, revalidating");
            self.binding
                .events
                .emit(CacheEvent::stale_served(self.namespace(), &key));
            // The refresh outlives this handle
            let _refresh = self.launch(&key, args);
            return Ok(entry.value);
        }

        if let Some(value) = self.hydrate(&key).await {
            return Ok(value);
        }

        debug!(namespace = %self.namespace(), key = %key, "Cache miss");
        self.binding.events.emit(CacheEvent::miss(self.namespace(), &key));
        self.launch(&key, args).await
    }

    /// Run the operation through the deduplicator, storing a success before
    /// the execution retires
    fn launch<A>(self: &Arc<Self>, key: &str, args: A) -> SharedResult<T, E>
    where
        O: Operation<A, T, E>,
        A: Send + 'static,
    {
        let core = Arc::clone(self);
        let owned_key = key.to_string();
        self.binding.dedup.run_or_join(key, move || -> OpFuture<T, E> {
            let operation = core.inner.call(args);
            Box::pin(async move {
                let result = operation.await;
                match result {
                    Ok(ref value) => core.remember(&owned_key, value).await,
                    Err(_) => {
                        debug!(namespace = %core.namespace(), key = %owned_key, "Operation failed, nothing cached")
                    }
                }
                result
            })
        })
    }

    async fn remember(&self, key: &str, value: &T) {
        let response = self
            .binding
            .store
            .set(key, value.clone(), self.config.ttl, self.config.group.as_deref())
            .await;
        debug!(
            namespace = %self.namespace(),
            key,
            created = response.created,
            "Stored result"
        );
        self.binding.events.emit(CacheEvent::Stored(StoredEvent {
            namespace: self.namespace().to_string(),
            key: key.to_string(),
            ttl_ms: self.config.ttl.0,
            group: self.config.group.clone(),
            timestamp: now_timestamp_ms(),
        }));

        if self.config.scope == CacheScope::Persistent {
            self.persist(key, value).await;
        }
    }

    /// Write the entry to the persistence backend; failures are only logged.
    ///
    /// Awaited inside the deduplicated execution, so the caller's result
    /// arrives after the record is written and writes to one key never
    /// overlap.
    async fn persist(&self, key: &str, value: &T) {
        let Some(backend) = self.binding.persistence.as_ref() else {
            return;
        };
        let record = PersistedRecord::new(value.clone(), self.config.ttl, self.config.group.clone());
        let storage_key = storage_key(self.namespace(), key);

        let written = match record.encode() {
            Ok(text) => backend.set(&storage_key, text).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(key = %storage_key, "Failed to persist cache entry: {}", e);
        }
    }

    /// Load a persisted entry into the memory store
    async fn hydrate(&self, key: &str) -> Option<T> {
        if self.config.scope != CacheScope::Persistent {
            return None;
        }
        let backend = self.binding.persistence.as_ref()?;
        let storage_key = storage_key(self.namespace(), key);

        let text = match backend.get(&storage_key).await {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %storage_key, "Failed to read persisted entry: {}", e);
                return None;
            }
        };

        let record = match PersistedRecord::<T>::decode(&text) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %storage_key, "Discarding unreadable persisted entry: {}", e);
                return None;
            }
        };

        if record.is_expired() {
            debug!(key = %storage_key, "Persisted entry expired");
            if let Err(e) = backend.remove(&storage_key).await {
                warn!(key = %storage_key, "Failed to remove expired persisted entry: {}", e);
            }
            return None;
        }

        self.binding
            .store
            .set(key, record.value.clone(), record.remaining_ttl(), record.group.as_deref())
            .await;
        debug!(namespace = %self.namespace(), key, "Hydrated entry from persistence");
        self.binding.events.emit(CacheEvent::hit(self.namespace(), key));
        Some(record.value)
    }
}

/// Read-through cache in front of an operation.
///
/// Fresh entries are served without invoking the operation; misses run it
/// once per key however many callers arrive. Only successes are stored, and
/// a store or persistence failure never fails the call.
pub struct Cached<O, A, T, E>
where
    T: Clone + Send + Sync + 'static,
{
    core: Arc<CacheCore<O, T, E>>,
    keys: KeyGenerator<A>,
}

impl<O, A, T, E> Cached<O, A, T, E>
where
    O: Operation<A, T, E>,
    A: Send + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(
        inner: O,
        keys: KeyGenerator<A>,
        config: CacheConfig,
        binding: CacheBinding<T, E>,
    ) -> Result<Self> {
        config.validate()?;
        if config.scope == CacheScope::Persistent && binding.persistence.is_none() {
            return Err(Error::configuration(format!(
                "cache '{}' uses persistent scope but no persistence backend is configured",
                config.name
            )));
        }

        Ok(Self {
            core: Arc::new(CacheCore {
                inner,
                config,
                binding,
            }),
            keys,
        })
    }

    pub fn namespace(&self) -> &str {
        self.core.namespace()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore<T>> {
        &self.core.binding.store
    }

    /// Drop the entry cached for `args`, including its persisted copy
    pub async fn invalidate(&self, args: &A) -> Result<bool> {
        let key = self.keys.generate(args)?;
        let mut removed = self.core.binding.store.invalidate(&key).await;

        if self.core.config.scope == CacheScope::Persistent {
            if let Some(ref backend) = self.core.binding.persistence {
                match backend.remove(&storage_key(self.namespace(), &key)).await {
                    Ok(found) => removed |= found,
                    Err(e) => warn!(key = %key, "Failed to remove persisted entry: {}", e),
                }
            }
        }
        Ok(removed)
    }
}

impl<O, A, T, E> Operation<A, T, E> for Cached<O, A, T, E>
where
    O: Operation<A, T, E>,
    A: Send + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn call(&self, args: A) -> OpFuture<T, E> {
        let key = match self.keys.generate(&args) {
            Ok(key) => key,
            Err(e) => {
                warn!(namespace = %self.namespace(), "Bypassing cache: {}", e);
                return self.core.inner.call(args);
            }
        };

        let core = Arc::clone(&self.core);
        Box::pin(core.resolve(key, args))
    }
}

impl<O, A, T, E> Debug for Cached<O, A, T, E>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached")
            .field("namespace", &self.core.binding.namespace)
            .field("config", &self.core.config)
            .finish()
    }
}
