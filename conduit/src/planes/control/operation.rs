use crate::domain::response::InvalidateResponse;
use async_trait::async_trait;

/// Process-wide management surface over every cache an owner created
#[async_trait]
pub trait CacheManagement: Send + Sync + 'static {
    /// Drop `key` wherever it is cached; returns how many caches held it
    async fn invalidate(&self, key: &str) -> usize;
    async fn invalidate_group(&self, group: &str) -> InvalidateResponse;
    async fn clear_all(&self) -> InvalidateResponse;
}
