use crate::domain::CacheConfig;
use crate::keys::KeyGenerator;
use crate::planes::control::Registry;
use crate::planes::data::{Cached, Deduped, Memoized, Memoizer, Queued, RetryPolicy, Retrying};
use crate::ports::Operation;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shared::Result;
use std::sync::Arc;

/// Combinators that wrap an operation in a control layer.
///
/// Each call nests the current operation inside a new wrapper, so the first
/// combinator applied sits closest to the raw operation and runs first:
/// `op.retry(p).deduplicated(..)` shares one retrying execution per key.
pub trait OperationExt<A, T, E>: Operation<A, T, E> + Sized {
    fn retry(self, policy: RetryPolicy<T, E>) -> Retrying<Self, T, E> {
        Retrying::new(self, policy)
    }

    /// Share one execution among concurrent calls with equal keys, using the
    /// registry's deduplicator for the key prefix
    fn deduplicated(self, keys: KeyGenerator<A>, registry: &Registry) -> Result<Deduped<Self, A, T, E>>
    where
        A: Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let dedup = registry.deduplicator(keys.prefix())?;
        Ok(Deduped::new(self, keys, dedup))
    }

    fn cached(
        self,
        keys: KeyGenerator<A>,
        config: CacheConfig,
        registry: &Registry,
    ) -> Result<Cached<Self, A, T, E>>
    where
        A: Send + 'static,
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let binding = registry.cache_binding(&config)?;
        Cached::new(self, keys, config, binding)
    }

    fn queued(self, queue_id: impl Into<String>, registry: &Registry) -> Queued<Self, A, T, E> {
        Queued::new(self, queue_id, registry.queues())
    }

    fn memoized(self, keys: KeyGenerator<A>, memo: Arc<Memoizer<T, E>>) -> Memoized<Self, A, T, E> {
        Memoized::new(self, keys, memo)
    }
}

impl<O, A, T, E> OperationExt<A, T, E> for O where O: Operation<A, T, E> {}
