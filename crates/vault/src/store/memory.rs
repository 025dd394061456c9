//! [`MemoryStore`]: an in-process [`RecordStore`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{RecordFilter, RecordStore, StoreError, StoredRecord};
use crate::crypto::Salt;

#[derive(Debug, Default)]
struct Inner {
    /// kind → id → record
    records: HashMap<String, BTreeMap<String, StoredRecord>>,
    secrets: HashMap<String, String>,
    salts: HashMap<String, Salt>,
    writes: usize,
}

/// Thread-safe in-memory store.
///
/// Clones share the same data. Counts record writes so callers can observe
/// how many saves an operation issued.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a user's secret.
    pub async fn put_user(&self, user_id: &str, secret: &str) {
        let mut inner = self.inner.write().await;
        inner.secrets.insert(user_id.to_owned(), secret.to_owned());
    }

    /// Insert a record without counting it as a write.
    pub async fn seed(&self, kind: &str, record: StoredRecord) {
        let mut inner = self.inner.write().await;
        inner
            .records
            .entry(kind.to_owned())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Number of [`RecordStore::save_record`] calls that succeeded.
    pub async fn write_count(&self) -> usize {
        self.inner.read().await.writes
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_record(&self, kind: &str, id: &str) -> Result<StoredRecord, StoreError> {
        let inner = self.inner.read().await;
        inner
            .records
            .get(kind)
            .and_then(|by_id| by_id.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_owned(),
                id: id.to_owned(),
            })
    }

    async fn save_record(&self, kind: &str, record: &StoredRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .records
            .entry(kind.to_owned())
            .or_default()
            .insert(record.id.clone(), record.clone());
        inner.writes += 1;
        Ok(())
    }

    async fn list_records(
        &self,
        kind: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.read().await;
        let Some(by_id) = inner.records.get(kind) else {
            return Ok(Vec::new());
        };
        Ok(by_id
            .values()
            .filter(|r| filter.owner.as_deref().map_or(true, |o| r.owner == o))
            .cloned()
            .collect())
    }

    async fn load_user_secret(&self, user_id: &str) -> Result<String, StoreError> {
        let inner = self.inner.read().await;
        inner
            .secrets
            .get(user_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownUser(user_id.to_owned()))
    }

    async fn load_recovery_salt(&self, user_id: &str) -> Result<Option<Salt>, StoreError> {
        let inner = self.inner.read().await;
        if !inner.secrets.contains_key(user_id) {
            return Err(StoreError::UnknownUser(user_id.to_owned()));
        }
        Ok(inner.salts.get(user_id).copied())
    }

    async fn load_or_create_recovery_salt(
        &self,
        user_id: &str,
        candidate: Salt,
    ) -> Result<Salt, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.secrets.contains_key(user_id) {
            return Err(StoreError::UnknownUser(user_id.to_owned()));
        }
        Ok(*inner.salts.entry(user_id.to_owned()).or_insert(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(id: &str, owner: &str) -> StoredRecord {
        let fields = match json!({"amount": 1.5}) {
            serde_json::Value::Object(m) => m,
            _ => unreachable!(),
        };
        StoredRecord {
            id: id.into(),
            owner: owner.into(),
            fields,
        }
    }

    #[tokio::test]
    async fn save_and_load() {
        let store = MemoryStore::new();
        store.save_record("expense", &rec("e1", "alice")).await.unwrap();
        let loaded = store.load_record("expense", "e1").await.unwrap();
        assert_eq!(loaded.owner, "alice");
        assert_eq!(store.write_count().await, 1);
        assert!(matches!(
            store.load_record("expense", "e2").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_by_owner() {
        let store = MemoryStore::new();
        store.seed("expense", rec("e2", "bob")).await;
        store.seed("expense", rec("e1", "alice")).await;
        store.seed("expense", rec("e3", "alice")).await;

        let alice = store
            .list_records("expense", &RecordFilter::owned_by("alice"))
            .await
            .unwrap();
        let ids: Vec<_> = alice.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["e1", "e3"]);

        let all = store
            .list_records("expense", &RecordFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(store
            .list_records("loan", &RecordFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn recovery_salt_is_created_once() {
        let store = MemoryStore::new();
        store.put_user("alice", "hash").await;
        assert_eq!(store.load_recovery_salt("alice").await.unwrap(), None);

        let first = store
            .load_or_create_recovery_salt("alice", [1u8; 16])
            .await
            .unwrap();
        let second = store
            .load_or_create_recovery_salt("alice", [2u8; 16])
            .await
            .unwrap();
        assert_eq!(first, [1u8; 16]);
        assert_eq!(second, first);
        assert_eq!(store.load_recovery_salt("alice").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn unknown_user_errors() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.load_user_secret("ghost").await,
            Err(StoreError::UnknownUser(_))
        ));
        assert!(store
            .load_or_create_recovery_salt("ghost", [0u8; 16])
            .await
            .is_err());
    }
}
