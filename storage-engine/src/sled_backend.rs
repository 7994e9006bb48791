use async_trait::async_trait;
use conduit::ports::PersistenceBackend;
use shared::{Error, Result};
use std::path::Path;
use tracing::info;

/// Sled-based persistence backend for persistent-scope caches.
///
/// Records are stored as UTF-8 text under their storage key. Every write is
/// flushed before returning.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    /// Open (or create) the database at `path`, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }

        let db = sled::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open Sled database: {}", e)))?;

        info!(path = %path.display(), "Opened Sled persistence backend");
        Ok(Self { db })
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| Error::Storage(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }
}

fn decode_text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Serialization(format!("Stored record is not UTF-8: {}", e)))
}

#[async_trait]
impl PersistenceBackend for SledBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| Error::Storage(format!("Failed to read record: {}", e)))?;

        value.map(|bytes| decode_text(&bytes)).transpose()
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value.into_bytes())
            .map_err(|e| Error::Storage(format!("Failed to save record: {}", e)))?;
        self.flush().await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let removed = self
            .db
            .remove(key.as_bytes())
            .map_err(|e| Error::Storage(format!("Failed to delete record: {}", e)))?
            .is_some();

        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for result in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) =
                result.map_err(|e| Error::Storage(format!("Failed to iterate database: {}", e)))?;
            keys.push(decode_text(&key)?);
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for SledBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledBackend")
            .field("records", &self.db.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit::persistence::{PersistedRecord, namespace_prefix, storage_key};
    use shared::TtlMs;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SledBackend) {
        let dir = TempDir::new().unwrap();
        let backend = SledBackend::open(dir.path().join("conduit.db")).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let (_dir, backend) = open_temp();

        backend.set("slots/a", "one".to_string()).await.unwrap();
        assert_eq!(backend.get("slots/a").await.unwrap().as_deref(), Some("one"));

        assert!(backend.remove("slots/a").await.unwrap());
        assert!(!backend.remove("slots/a").await.unwrap());
        assert_eq!(backend.get("slots/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let (_dir, backend) = open_temp();
        backend.set("slots/b", "2".to_string()).await.unwrap();
        backend.set("slots/a", "1".to_string()).await.unwrap();
        backend.set("rooms/a", "3".to_string()).await.unwrap();

        let keys = backend.keys_with_prefix("slots/").await.unwrap();
        assert_eq!(keys, vec!["slots/a".to_string(), "slots/b".to_string()]);
        assert!(backend.keys_with_prefix("doctors/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("conduit.db");
        let record = PersistedRecord::new(vec![9u32, 10], TtlMs::NEVER, Some("week".to_string()));

        {
            let backend = SledBackend::open(&path).unwrap();
            backend
                .set(&storage_key("slots", "slots:1"), record.encode().unwrap())
                .await
                .unwrap();
        }

        let backend = SledBackend::open(&path).unwrap();
        let keys = backend.keys_with_prefix(&namespace_prefix("slots")).await.unwrap();
        assert_eq!(keys, vec!["slots/slots:1".to_string()]);

        let text = backend.get("slots/slots:1").await.unwrap().unwrap();
        assert_eq!(PersistedRecord::<Vec<u32>>::decode(&text).unwrap(), record);
    }
}
