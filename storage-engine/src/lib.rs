//! Third-party storage adapters for conduit: a moka cache store and a sled
//! persistence backend.

pub mod moka_cache;
pub mod sled_backend;

pub use moka_cache::MokaCacheStore;
pub use sled_backend::SledBackend;

#[cfg(test)]
mod tests {
    use super::*;
    use conduit::domain::{CacheConfig, CacheScope};
    use conduit::keys::KeyGenerator;
    use conduit::ports::{CacheStore, OpFuture, Operation};
    use conduit::{OperationExt, Registry};
    use shared::{Error, TtlMs};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_registry_with_moka_store_and_sled_backend() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(SledBackend::open(dir.path().join("conduit.db")).unwrap());
        let registry = Registry::builder().persistence(backend.clone()).build();

        let store: Arc<dyn CacheStore<String>> = Arc::new(MokaCacheStore::new("rooms", Some(100)));
        registry.register_store("rooms", store).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = (move |id: u32| -> OpFuture<String, Error> {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(format!("room-{}", id)) })
        })
        .cached(
            KeyGenerator::serialized("rooms"),
            CacheConfig::new("rooms", TtlMs(60_000)).scope(CacheScope::Session),
            &registry,
        )
        .unwrap();

        assert_eq!(op.call(1).await.unwrap(), "room-1");
        assert_eq!(op.call(1).await.unwrap(), "room-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(registry.invalidate("rooms:1").await, 1);
        assert_eq!(op.call(1).await.unwrap(), "room-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
