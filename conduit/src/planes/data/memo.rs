use crate::domain::MemoConfig;
use crate::keys::KeyGenerator;
use crate::planes::data::dedup::Deduplicator;
use crate::ports::{CacheStore, MemoControl, OpFuture, Operation};
use crate::store::TtlStore;
use async_trait::async_trait;
use shared::{Result, TtlMs};
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Long-lived cache of successful results keyed by arguments.
///
/// Entries never expire; an optional size bound evicts the least recently
/// used result. Concurrent misses for one key share a single execution.
/// Failures are never remembered.
pub struct Memoizer<T, E> {
    name: String,
    store: Arc<dyn CacheStore<T>>,
    dedup: Deduplicator<T, E>,
}

impl<T, E> Memoizer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(config: MemoConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(TtlStore::new(config.name.clone(), config.max_size));
        Ok(Self::with_store(config.name, store))
    }

    /// Memoizer over a caller-supplied store
    pub fn with_store(name: impl Into<String>, store: Arc<dyn CacheStore<T>>) -> Self {
        let name = name.into();
        Self {
            dedup: Deduplicator::new(name.clone()),
            name,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remembered result for `key`, or the result of `make()` shared with any
    /// concurrent caller of the same key
    pub async fn get_or_compute<F>(&self, key: &str, make: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> OpFuture<T, E>,
    {
        if let Some(entry) = self.store.get(key).await {
            debug!(memo = %self.name, key, "Memo hit");
            return Ok(entry.value);
        }

        let store = Arc::clone(&self.store);
        let owned_key = key.to_string();
        self.dedup
            .run_or_join(key, move || {
                let operation = make();
                Box::pin(async move {
                    let result = operation.await;
                    if let Ok(ref value) = result {
                        // Stored before the execution retires so late callers hit
                        store.set(&owned_key, value.clone(), TtlMs::NEVER, None).await;
                    }
                    result
                })
            })
            .await
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.store.get(key).await.is_some()
    }

    /// Forget every result; returns how many were dropped
    pub async fn clear(&self) -> usize {
        let cleared = self.store.clear().await.invalidated;
        debug!(memo = %self.name, cleared, "Memo cleared");
        cleared
    }

    pub async fn clear_key(&self, key: &str) -> bool {
        self.store.invalidate(key).await
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl<T, E> MemoControl for Memoizer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    async fn clear(&self) -> usize {
        Memoizer::clear(self).await
    }

    async fn clear_key(&self, key: &str) -> bool {
        Memoizer::clear_key(self, key).await
    }

    async fn len(&self) -> usize {
        Memoizer::len(self).await
    }
}

impl<T, E> Debug for Memoizer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoizer")
            .field("name", &self.name)
            .finish()
    }
}

/// An operation whose successful results are remembered per argument key
pub struct Memoized<O, A, T, E> {
    inner: Arc<O>,
    keys: KeyGenerator<A>,
    memo: Arc<Memoizer<T, E>>,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<O, A, T, E> Memoized<O, A, T, E> {
    pub fn new(inner: O, keys: KeyGenerator<A>, memo: Arc<Memoizer<T, E>>) -> Self {
        Self {
            inner: Arc::new(inner),
            keys,
            memo,
            _marker: PhantomData,
        }
    }

    pub fn memoizer(&self) -> &Arc<Memoizer<T, E>> {
        &self.memo
    }
}

impl<O, A, T, E> Operation<A, T, E> for Memoized<O, A, T, E>
where
    O: Operation<A, T, E>,
    A: Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn call(&self, args: A) -> OpFuture<T, E> {
        let key = match self.keys.generate(&args) {
            Ok(key) => key,
            Err(e) => {
                warn!(memo = %self.memo.name(), "Bypassing memoization: {}", e);
                return self.inner.call(args);
            }
        };

        let inner = Arc::clone(&self.inner);
        let memo = Arc::clone(&self.memo);
        Box::pin(async move { memo.get_or_compute(&key, move || inner.call(args)).await })
    }
}
