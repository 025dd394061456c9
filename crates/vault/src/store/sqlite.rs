//! [`SqliteStore`]: a [`RecordStore`] backed by a single SQLite file.
//!
//! Records are stored as JSON text so that a protected field holds its
//! encrypted value object verbatim in place of the number.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{RecordFilter, RecordStore, StoreError, StoredRecord};
use crate::codec::Record;
use crate::crypto::{Salt, SALT_LEN};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id        TEXT PRIMARY KEY,
    secret         TEXT NOT NULL,
    recovery_salt  BLOB
);
CREATE TABLE IF NOT EXISTS records (
    kind   TEXT NOT NULL,
    id     TEXT NOT NULL,
    owner  TEXT NOT NULL,
    body   TEXT NOT NULL,
    PRIMARY KEY (kind, id)
);
CREATE INDEX IF NOT EXISTS records_owner ON records (kind, owner);
";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// SQLite-backed store. Clones share one connection.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        lock_conn(&self.conn)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = lock_conn(&conn)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task failed: {e}")))?
    }

    /// Register (or replace) a user's secret, keeping any recovery salt.
    pub fn put_user(&self, user_id: &str, secret: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (user_id, secret) VALUES (?1, ?2)
             ON CONFLICT (user_id) DO UPDATE SET secret = excluded.secret",
            params![user_id, secret],
        )?;
        Ok(())
    }
}

fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".into()))
}

fn decode_body(kind: &str, id: &str, body: &str) -> Result<Record, StoreError> {
    serde_json::from_str(body)
        .map_err(|e| StoreError::Corrupt(format!("{kind}/{id} body is not a JSON object: {e}")))
}

fn decode_salt(user_id: &str, bytes: Vec<u8>) -> Result<Salt, StoreError> {
    <Salt>::try_from(bytes.as_slice()).map_err(|_| {
        StoreError::Corrupt(format!(
            "recovery salt for {user_id} must be {SALT_LEN} bytes"
        ))
    })
}

fn select_recovery_salt(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<Option<Vec<u8>>>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT recovery_salt FROM users WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .optional()?)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn load_record(&self, kind: &str, id: &str) -> Result<StoredRecord, StoreError> {
        let (kind, id) = (kind.to_owned(), id.to_owned());
        self.with_conn(move |conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT owner, body FROM records WHERE kind = ?1 AND id = ?2",
                    params![kind, id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((owner, body)) = row else {
                return Err(StoreError::NotFound { kind, id });
            };
            let fields = decode_body(&kind, &id, &body)?;
            Ok(StoredRecord { id, owner, fields })
        })
        .await
    }

    async fn save_record(&self, kind: &str, record: &StoredRecord) -> Result<(), StoreError> {
        let body = serde_json::to_string(&record.fields)
            .map_err(|e| StoreError::Backend(format!("failed to encode record: {e}")))?;
        let (kind, id, owner) = (kind.to_owned(), record.id.clone(), record.owner.clone());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO records (kind, id, owner, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (kind, id) DO UPDATE SET owner = excluded.owner, body = excluded.body",
                params![kind, id, owner, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_records(
        &self,
        kind: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let (kind, owner) = (kind.to_owned(), filter.owner.clone());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner, body FROM records
                 WHERE kind = ?1 AND (?2 IS NULL OR owner = ?2)
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![kind, owner], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, owner, body) = row?;
                let fields = decode_body(&kind, &id, &body)?;
                out.push(StoredRecord { id, owner, fields });
            }
            Ok(out)
        })
        .await
    }

    async fn load_user_secret(&self, user_id: &str) -> Result<String, StoreError> {
        let user_id = user_id.to_owned();
        self.with_conn(move |conn| {
            let secret: Option<String> = conn
                .query_row(
                    "SELECT secret FROM users WHERE user_id = ?1",
                    params![user_id],
                    |r| r.get(0),
                )
                .optional()?;
            secret.ok_or(StoreError::UnknownUser(user_id))
        })
        .await
    }

    async fn load_recovery_salt(&self, user_id: &str) -> Result<Option<Salt>, StoreError> {
        let user_id = user_id.to_owned();
        self.with_conn(move |conn| match select_recovery_salt(conn, &user_id)? {
            None => Err(StoreError::UnknownUser(user_id)),
            Some(None) => Ok(None),
            Some(Some(bytes)) => decode_salt(&user_id, bytes).map(Some),
        })
        .await
    }

    async fn load_or_create_recovery_salt(
        &self,
        user_id: &str,
        candidate: Salt,
    ) -> Result<Salt, StoreError> {
        let user_id = user_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE users SET recovery_salt = ?2 WHERE user_id = ?1 AND recovery_salt IS NULL",
                params![user_id, &candidate[..]],
            )?;
            match select_recovery_salt(conn, &user_id)? {
                None => Err(StoreError::UnknownUser(user_id)),
                Some(None) => Err(StoreError::Corrupt(format!(
                    "recovery salt for {user_id} was not persisted"
                ))),
                Some(Some(bytes)) => decode_salt(&user_id, bytes),
            }
        })
        .await
    }
}
