//! The storage collaborator consumed by the migration and recovery driver.
//!
//! The encryption layer never owns persistence. It reaches records, user
//! secrets, and recovery salts only through [`RecordStore`]. Two backends are
//! provided: [`MemoryStore`] for tests and embedding, and [`SqliteStore`] for
//! the service binary.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::Record;
use crate::crypto::Salt;

/// Errors surfaced by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with this kind and id exists.
    #[error("record not found: {kind}/{id}")]
    NotFound {
        /// Record kind.
        kind: String,
        /// Record id.
        id: String,
    },

    /// The user has no stored credential.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// Stored data could not be decoded.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    /// The backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A record as held by the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Record id, unique per kind.
    pub id: String,
    /// Id of the owning user.
    pub owner: String,
    /// Record fields. Protected fields hold encrypted values.
    pub fields: Record,
}

/// Selection criteria for [`RecordStore::list_records`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Only records owned by this user.
    pub owner: Option<String>,
}

impl RecordFilter {
    /// Records owned by `user_id`.
    pub fn owned_by(user_id: impl Into<String>) -> Self {
        Self {
            owner: Some(user_id.into()),
        }
    }
}

/// Persistence operations the encryption layer depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load one record.
    async fn load_record(&self, kind: &str, id: &str) -> Result<StoredRecord, StoreError>;

    /// Insert or replace one record. The write is atomic per record.
    async fn save_record(&self, kind: &str, record: &StoredRecord) -> Result<(), StoreError>;

    /// All records of `kind` matching `filter`, ordered by id.
    async fn list_records(
        &self,
        kind: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// The user's long-term secret (credential hash).
    async fn load_user_secret(&self, user_id: &str) -> Result<String, StoreError>;

    /// The user's recovery salt, if one was ever assigned. Never creates one.
    async fn load_recovery_salt(&self, user_id: &str) -> Result<Option<Salt>, StoreError>;

    /// The user's recovery salt, persisting `candidate` first if none exists.
    ///
    /// Must be atomic: concurrent callers all observe the same stored salt.
    async fn load_or_create_recovery_salt(
        &self,
        user_id: &str,
        candidate: Salt,
    ) -> Result<Salt, StoreError>;
}
