//! In-memory record store. Nothing survives a restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Record, RecordStore};
use crate::error::IntakeError;

/// `HashMap` behind a `RwLock`, cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<HashMap<String, Record>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, email: &str) -> Result<(), IntakeError> {
        let mut guard = self.inner.write().await;
        guard.insert(email.to_string(), Record::new(email));
        Ok(())
    }

    async fn get(&self, email: &str) -> Result<Option<Record>, IntakeError> {
        Ok(self.inner.read().await.get(email).cloned())
    }

    async fn count(&self) -> Result<usize, IntakeError> {
        Ok(self.inner.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = MemoryRecordStore::new();

        store.save("a@b.com").await.unwrap();
        store.save("a@b.com").await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get("a@b.com").await.unwrap(), Some(Record::new("a@b.com")));
    }

    #[tokio::test]
    async fn test_concurrent_saves_same_address() {
        let store = MemoryRecordStore::new();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.save("same@example.com").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryRecordStore::new();
        assert_eq!(store.get("nobody@example.com").await.unwrap(), None);
    }
}
