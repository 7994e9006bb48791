#![deny(clippy::all)]

use crate::domain::CacheEntry;
use crate::domain::response::{InvalidateResponse, PutResponse};
use async_trait::async_trait;
use futures::future::BoxFuture;
use shared::{Result, TtlMs};
use std::future::Future;
use std::sync::Arc;

// Ports are the pluggable extension points: wrapped operations, cache stores
// and persistence backends

/// Deferred result produced by an operation
pub type OpFuture<T, E> = BoxFuture<'static, std::result::Result<T, E>>;

/// Any unit of work returning a deferred result.
///
/// Implemented for every `Fn(A) -> impl Future<Output = Result<T, E>>` and for
/// each control wrapper, so wrappers nest: the innermost one runs first.
pub trait Operation<A, T, E>: Send + Sync + 'static {
    fn call(&self, args: A) -> OpFuture<T, E>;
}

impl<F, Fut, A, T, E> Operation<A, T, E> for F
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
{
    fn call(&self, args: A) -> OpFuture<T, E> {
        Box::pin(self(args))
    }
}

/// Classifies operation failures for the default retry predicate
pub trait ErrorStatus {
    /// Status code attached to the failure, if any
    fn status_code(&self) -> Option<u16>;

    /// Transport-level failures (no response at all) count as transient
    fn is_transport(&self) -> bool {
        self.status_code().is_none()
    }
}

impl ErrorStatus for shared::Error {
    fn status_code(&self) -> Option<u16> {
        match self {
            shared::Error::Operation { status, .. } => *status,
            _ => None,
        }
    }

    fn is_transport(&self) -> bool {
        matches!(self, shared::Error::Operation { status: None, .. })
    }
}

/// Port for keyed value storage with expiry, groups and a size bound
#[async_trait]
pub trait CacheStore<V>: Send + Sync + 'static
where
    V: Clone + Send + Sync + 'static,
{
    /// Live entry for `key`; expired entries are reported as absent
    async fn get(&self, key: &str) -> Option<CacheEntry<V>>;

    /// Entry for `key` even when it has expired
    async fn get_stale(&self, key: &str) -> Option<CacheEntry<V>>;

    async fn set(&self, key: &str, value: V, ttl: TtlMs, group: Option<&str>) -> PutResponse;

    /// Restart the expiry window of `key`; false when absent or expired
    async fn touch(&self, key: &str) -> bool;

    async fn invalidate(&self, key: &str) -> bool;

    async fn invalidate_group(&self, group: &str) -> InvalidateResponse;

    async fn clear(&self) -> InvalidateResponse;

    async fn purge_expired(&self) -> InvalidateResponse;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Type-erased management view over a store, used by the registry
#[async_trait]
pub trait StoreControl: Send + Sync + 'static {
    async fn invalidate(&self, key: &str) -> bool;
    async fn invalidate_group(&self, group: &str) -> InvalidateResponse;
    async fn clear(&self) -> InvalidateResponse;
    async fn purge_expired(&self) -> InvalidateResponse;
    async fn len(&self) -> usize;
}

/// Adapts a typed store to the erased management view
pub struct StoreHandle<V>(pub Arc<dyn CacheStore<V>>)
where
    V: Clone + Send + Sync + 'static;

#[async_trait]
impl<V> StoreControl for StoreHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn invalidate(&self, key: &str) -> bool {
        self.0.invalidate(key).await
    }

    async fn invalidate_group(&self, group: &str) -> InvalidateResponse {
        self.0.invalidate_group(group).await
    }

    async fn clear(&self) -> InvalidateResponse {
        self.0.clear().await
    }

    async fn purge_expired(&self) -> InvalidateResponse {
        self.0.purge_expired().await
    }

    async fn len(&self) -> usize {
        self.0.len().await
    }
}

/// Type-erased management view over a memoizer
#[async_trait]
pub trait MemoControl: Send + Sync + 'static {
    async fn clear(&self) -> usize;
    async fn clear_key(&self, key: &str) -> bool;
    async fn len(&self) -> usize;
}

/// Port for the external key-value store behind persistent-scope caching.
/// Values are flat text records.
#[async_trait]
pub trait PersistenceBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<bool>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closure_is_an_operation() {
        let double = |n: u32| async move { Ok::<_, shared::Error>(n * 2) };
        assert_eq!(double.call(21).await.unwrap(), 42);
    }

    #[test]
    fn test_error_status_for_shared_error() {
        assert_eq!(shared::Error::status(503, "busy").status_code(), Some(503));
        assert!(shared::Error::transport("reset").is_transport());
        assert!(!shared::Error::configuration("bad").is_transport());
        assert_eq!(shared::Error::configuration("bad").status_code(), None);
    }
}
