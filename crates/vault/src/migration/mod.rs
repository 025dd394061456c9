//! Out-of-band maintenance: encrypting legacy plaintext amounts in place, and
//! operator recovery through the master-secret escrow.
//!
//! Neither operation is reachable from the ordinary read/write path. Both are
//! driven by an administrative trigger.
//!
//! # Ordering
//!
//! - Records are independent; one failing record never stops a batch.
//! - Runs for the same user are serialised through a per-user lock, so two
//!   concurrent migrations cannot race on a record.
//! - Each record is encrypted completely in memory before its single write.
//! - Key derivation and field encryption run on the blocking pool, never on
//!   an async worker.
//!
//! # Audit
//!
//! Every recovery attempt, successful or not, is logged on the `audit`
//! tracing target with the operator and reason. Amounts are never logged.

pub mod locks;

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::codec::{CodecError, RecordCodec};
use crate::crypto::{random_salt, CryptoError, MasterSecret};
use crate::store::{RecordFilter, RecordStore, StoreError, StoredRecord};

use locks::UserLocks;

/// Errors that stop a migration run before any record is processed.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The encryption feature flag is off.
    #[error("encryption is disabled")]
    EncryptionDisabled,

    /// The record kind has no field policy.
    #[error("unknown record kind: {0}")]
    UnknownKind(String),

    /// The user secret is unusable.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The store could not supply the user's salt or record list.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A blocking key-derivation task did not complete.
    #[error("migration task failed: {0}")]
    Task(String),
}

/// Errors from the emergency recovery path. All are fatal to the call.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The invocation did not name an operator and a reason.
    #[error("recovery requires a named operator and reason")]
    Unauthorized,

    /// An override master secret was supplied but overrides are disabled.
    #[error("emergency master secret override is not permitted")]
    OverrideNotPermitted,

    /// The record kind has no field policy.
    #[error("unknown record kind: {0}")]
    UnknownKind(String),

    /// The user was never assigned a recovery salt.
    #[error("no recovery salt stored for user {0}")]
    MissingSalt(String),

    /// A field could not be recovered.
    #[error("record {record_id} field {field}: {source}")]
    Field {
        /// Record id.
        record_id: String,
        /// Field name.
        field: String,
        /// Underlying crypto error.
        source: CryptoError,
    },

    /// Escrow key derivation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The blocking recovery task did not complete.
    #[error("recovery task failed: {0}")]
    Task(String),
}

/// Outcome counts of one [`Migrator::migrate_user`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Records examined.
    pub scanned: usize,
    /// Records rewritten.
    pub written: usize,
    /// Records with nothing left to encrypt.
    pub already_encrypted: usize,
    /// Records skipped because of an error.
    pub failed: usize,
}

/// An explicit, attributable authorisation for one recovery call.
#[derive(Debug, Clone)]
pub struct RecoveryGrant {
    operator: String,
    reason: String,
}

impl RecoveryGrant {
    /// Name the operator and the reason for the recovery.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Unauthorized`] if either is blank.
    pub fn new(
        operator: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Self, RecoveryError> {
        let operator = operator.into();
        let reason = reason.into();
        if operator.trim().is_empty() || reason.trim().is_empty() {
            return Err(RecoveryError::Unauthorized);
        }
        Ok(Self { operator, reason })
    }

    /// The operator performing the recovery.
    pub fn operator(&self) -> &str {
        &self.operator
    }

    /// The stated reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Drives migration and recovery against a [`RecordStore`].
#[derive(Clone)]
pub struct Migrator {
    codec: RecordCodec,
    store: Arc<dyn RecordStore>,
    locks: UserLocks,
    allow_recovery_override: bool,
}

impl Migrator {
    /// Create a driver. `allow_recovery_override` gates the optional
    /// emergency master secret of [`Migrator::recover_without_user_secret`].
    pub fn new(
        codec: RecordCodec,
        store: Arc<dyn RecordStore>,
        allow_recovery_override: bool,
    ) -> Self {
        Self {
            codec,
            store,
            locks: UserLocks::default(),
            allow_recovery_override,
        }
    }

    /// Encrypt every remaining plaintext amount in `user_id`'s records of `kind`.
    ///
    /// Idempotent: records with nothing to encrypt are not written. Assigns
    /// the user's recovery salt on first use so migrated values are escrowed.
    ///
    /// # Errors
    ///
    /// Fails only before the batch starts. Per-record failures are logged
    /// and counted in [`MigrationReport::failed`].
    pub async fn migrate_user(
        &self,
        user_id: &str,
        kind: &str,
        user_secret: &str,
    ) -> Result<MigrationReport, MigrationError> {
        if !self.codec.is_enabled() {
            return Err(MigrationError::EncryptionDisabled);
        }
        if self.codec.policy().fields(kind).is_err() {
            return Err(MigrationError::UnknownKind(kind.to_owned()));
        }

        let _guard = self.locks.acquire(user_id).await;
        info!(user_id, kind, "migration started");

        let salt = self
            .store
            .load_or_create_recovery_salt(user_id, random_salt())
            .await?;
        let cipher = self.codec.cipher().clone();
        let secret = Zeroizing::new(user_secret.to_owned());
        let credential =
            tokio::task::spawn_blocking(move || cipher.credential(&secret, Some(&salt)))
                .await
                .map_err(|e| MigrationError::Task(e.to_string()))??;
        let credential = Arc::new(credential);
        let records = self
            .store
            .list_records(kind, &RecordFilter::owned_by(user_id))
            .await?;

        let mut report = MigrationReport::default();
        for record in records {
            report.scanned += 1;
            let record_id = record.id.clone();
            let task = {
                let (codec, credential, kind) =
                    (self.codec.clone(), Arc::clone(&credential), kind.to_owned());
                tokio::task::spawn_blocking(move || {
                    let protected = codec.protect(&record.fields, &kind, &credential);
                    (record, protected)
                })
            };
            let (record, protected) = match task.await {
                Ok((record, Ok(p))) => (record, p),
                Ok((_, Err(e))) => {
                    warn!(user_id, kind, %record_id, error = %e, "record skipped");
                    report.failed += 1;
                    continue;
                }
                Err(e) => {
                    warn!(user_id, kind, %record_id, error = %e, "record task failed");
                    report.failed += 1;
                    continue;
                }
            };
            if protected.encrypted_fields.is_empty() {
                report.already_encrypted += 1;
                continue;
            }

            let updated = StoredRecord {
                fields: protected.record,
                ..record
            };
            match self.store.save_record(kind, &updated).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    warn!(user_id, kind, record_id = %updated.id, error = %e, "record write failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            user_id,
            kind,
            scanned = report.scanned,
            written = report.written,
            already_encrypted = report.already_encrypted,
            failed = report.failed,
            "migration finished"
        );
        Ok(report)
    }

    /// Decrypt `user_id`'s records of `kind` without the user's secret.
    ///
    /// Uses the escrow copies written alongside each value, keyed from the
    /// master secret and the user's stored recovery salt. With
    /// `emergency_master_secret`, that secret replaces the standing one; this
    /// requires the override to be enabled at construction.
    ///
    /// Records are returned and never written back.
    ///
    /// # Errors
    ///
    /// Any failure fails the whole call and is written to the audit log.
    pub async fn recover_without_user_secret(
        &self,
        grant: &RecoveryGrant,
        user_id: &str,
        kind: &str,
        emergency_master_secret: Option<MasterSecret>,
    ) -> Result<Vec<StoredRecord>, RecoveryError> {
        let with_override = emergency_master_secret.is_some();
        warn!(
            target: "audit",
            operator = grant.operator(),
            reason = grant.reason(),
            user_id,
            kind,
            with_override,
            "emergency recovery invoked"
        );

        let result = self
            .recover_inner(user_id, kind, emergency_master_secret)
            .await;
        match &result {
            Ok(records) => warn!(
                target: "audit",
                operator = grant.operator(),
                user_id,
                kind,
                recovered = records.len(),
                "emergency recovery succeeded"
            ),
            Err(e) => error!(
                target: "audit",
                operator = grant.operator(),
                user_id,
                kind,
                error = %e,
                "emergency recovery failed"
            ),
        }
        result
    }

    async fn recover_inner(
        &self,
        user_id: &str,
        kind: &str,
        emergency_master_secret: Option<MasterSecret>,
    ) -> Result<Vec<StoredRecord>, RecoveryError> {
        if emergency_master_secret.is_some() && !self.allow_recovery_override {
            return Err(RecoveryError::OverrideNotPermitted);
        }
        if self.codec.policy().fields(kind).is_err() {
            return Err(RecoveryError::UnknownKind(kind.to_owned()));
        }

        let salt = self
            .store
            .load_recovery_salt(user_id)
            .await?
            .ok_or_else(|| RecoveryError::MissingSalt(user_id.to_owned()))?;
        let records = self
            .store
            .list_records(kind, &RecordFilter::owned_by(user_id))
            .await?;

        let codec = self.codec.clone();
        let kind = kind.to_owned();
        tokio::task::spawn_blocking(move || -> Result<Vec<StoredRecord>, RecoveryError> {
            let cipher = codec.cipher();
            let key = match &emergency_master_secret {
                Some(master) => cipher.escrow_key_with(master, &salt)?,
                None => cipher.escrow_key(&salt)?,
            };
            records
                .into_iter()
                .map(|record| -> Result<StoredRecord, RecoveryError> {
                    let fields = codec
                        .recover(&record.fields, &kind, &key)
                        .map_err(|e| match e {
                            CodecError::Field { field, source } => RecoveryError::Field {
                                record_id: record.id.clone(),
                                field,
                                source,
                            },
                            CodecError::UnknownKind(kind) => RecoveryError::UnknownKind(kind),
                        })?;
                    Ok(StoredRecord { fields, ..record })
                })
                .collect()
        })
        .await
        .map_err(|e| RecoveryError::Task(e.to_string()))?
    }
}
