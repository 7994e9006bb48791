use crate::ports::PersistenceBackend;
use async_trait::async_trait;
use dashmap::DashMap;
use shared::Result;

/// Process-local persistence backend; records live as long as the backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: DashMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.records.get(key).map(|value| value.clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.records.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.records.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .records
            .iter()
            .filter(|record| record.key().starts_with(prefix))
            .map(|record| record.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let backend = MemoryBackend::new();
        backend.set("slots/a", "1".to_string()).await.unwrap();

        assert_eq!(backend.get("slots/a").await.unwrap().as_deref(), Some("1"));
        assert!(backend.remove("slots/a").await.unwrap());
        assert!(!backend.remove("slots/a").await.unwrap());
        assert_eq!(backend.get("slots/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let backend = MemoryBackend::new();
        for key in ["slots/b", "slots/a", "rooms/a"] {
            backend.set(key, String::new()).await.unwrap();
        }

        let keys = backend.keys_with_prefix("slots/").await.unwrap();
        assert_eq!(keys, vec!["slots/a", "slots/b"]);
    }
}
