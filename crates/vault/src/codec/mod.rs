//! Applies the field cipher to the policy-selected fields of a record.
//!
//! The codec is a pure transform: it never mutates its input, performs no
//! I/O, and returns a fully computed record or an error. Storage code calls
//! [`RecordCodec::protect`] before writes and [`RecordCodec::reveal`] after reads.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{Amount, Credential, CryptoError, EncryptedValue, EscrowKey, FieldCipher};
use crate::policy::FieldEncryptionPolicy;

/// A structured record as stored: a JSON object.
pub type Record = serde_json::Map<String, Value>;

/// Errors from the record codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No field policy exists for the record kind.
    #[error("unknown record kind: {0}")]
    UnknownKind(String),

    /// A field could not be processed and the whole record was rejected.
    #[error("field {field}: {source}")]
    Field {
        /// Name of the failing field.
        field: String,
        /// Underlying crypto error.
        source: CryptoError,
    },
}

/// Output of [`RecordCodec::protect`].
#[derive(Debug, Clone)]
pub struct Protected {
    /// The record with newly encrypted fields.
    pub record: Record,
    /// Fields encrypted by this call. Empty if nothing changed.
    pub encrypted_fields: Vec<String>,
}

/// A field left encrypted by [`RecordCodec::reveal`].
#[derive(Debug, Clone)]
pub struct FieldFailure {
    /// Field name.
    pub field: String,
    /// Why decryption failed.
    pub error: CryptoError,
}

/// Output of [`RecordCodec::reveal`].
#[derive(Debug, Clone)]
pub struct Revealed {
    /// The record with every decryptable field restored.
    pub record: Record,
    /// Fields that stayed encrypted.
    pub failures: Vec<FieldFailure>,
}

impl Revealed {
    /// `true` if at least one field could not be decrypted.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Encrypts and decrypts the sensitive fields of records.
#[derive(Clone, Debug)]
pub struct RecordCodec {
    cipher: FieldCipher,
    policy: Arc<FieldEncryptionPolicy>,
    enabled: bool,
}

impl RecordCodec {
    /// Create a codec. With `enabled == false`, [`RecordCodec::protect`]
    /// passes records through; reads still decrypt.
    pub fn new(cipher: FieldCipher, policy: Arc<FieldEncryptionPolicy>, enabled: bool) -> Self {
        Self {
            cipher,
            policy,
            enabled,
        }
    }

    /// The underlying field cipher.
    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    /// The field policy in force.
    pub fn policy(&self) -> &FieldEncryptionPolicy {
        &self.policy
    }

    /// Whether new writes are encrypted.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn fields(&self, kind: &str) -> Result<&[String], CodecError> {
        self.policy
            .fields(kind)
            .map_err(|_| CodecError::UnknownKind(kind.to_owned()))
    }

    /// Encrypt every plain-number policy field of `record`.
    ///
    /// Fields already holding an encrypted value, or holding anything other
    /// than a number, are passed through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownKind`] for an unconfigured kind and
    /// [`CodecError::Field`] if any field cannot be encrypted. In the error
    /// case no partially encrypted record is produced.
    pub fn protect(
        &self,
        record: &Record,
        kind: &str,
        credential: &Credential,
    ) -> Result<Protected, CodecError> {
        let fields = self.fields(kind)?;
        if !self.enabled {
            return Ok(Protected {
                record: record.clone(),
                encrypted_fields: Vec::new(),
            });
        }

        let mut out = record.clone();
        let mut encrypted_fields = Vec::new();
        for field in fields {
            let Some(Value::Number(number)) = record.get(field) else {
                continue;
            };
            let sealed = Amount::from_json(number)
                .and_then(|amount| self.cipher.encrypt_for(amount, credential))
                .and_then(|value| value.to_json())
                .map_err(|source| CodecError::Field {
                    field: field.clone(),
                    source,
                })?;
            out.insert(field.clone(), sealed);
            encrypted_fields.push(field.clone());
        }

        debug!(kind, encrypted = encrypted_fields.len(), "record protected");
        Ok(Protected {
            record: out,
            encrypted_fields,
        })
    }

    /// Decrypt every encrypted policy field of `record`.
    ///
    /// A field that fails authentication or holds a malformed payload is left
    /// encrypted and reported in [`Revealed::failures`]; it is never replaced
    /// by a default number.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownKind`] for an unconfigured kind and
    /// [`CodecError::Field`] for failures that are not field-local, such as
    /// an empty user secret.
    pub fn reveal(
        &self,
        record: &Record,
        kind: &str,
        user_secret: &str,
    ) -> Result<Revealed, CodecError> {
        let fields = self.fields(kind)?;

        let mut out = record.clone();
        let mut failures = Vec::new();
        for field in fields {
            let Some(value) = record.get(field) else {
                continue;
            };
            if !EncryptedValue::is_encrypted(value) {
                continue;
            }
            let result = EncryptedValue::from_json(value)
                .and_then(|sealed| self.cipher.decrypt(&sealed, user_secret));
            match result {
                Ok(amount) => {
                    out.insert(field.clone(), amount.to_json());
                }
                Err(error) if error.is_field_recoverable() => {
                    warn!(kind, field = %field, error = error.kind(), "field left encrypted");
                    failures.push(FieldFailure {
                        field: field.clone(),
                        error,
                    });
                }
                Err(source) => {
                    return Err(CodecError::Field {
                        field: field.clone(),
                        source,
                    })
                }
            }
        }

        Ok(Revealed {
            record: out,
            failures,
        })
    }

    /// Decrypt every encrypted policy field of `record` from its escrow copy.
    ///
    /// Strict: the first field that cannot be recovered fails the record.
    pub fn recover(
        &self,
        record: &Record,
        kind: &str,
        key: &EscrowKey,
    ) -> Result<Record, CodecError> {
        let fields = self.fields(kind)?;

        let mut out = record.clone();
        for field in fields {
            let Some(value) = record.get(field) else {
                continue;
            };
            if !EncryptedValue::is_encrypted(value) {
                continue;
            }
            let amount = EncryptedValue::from_json(value)
                .and_then(|sealed| self.cipher.recover(&sealed, key))
                .map_err(|source| CodecError::Field {
                    field: field.clone(),
                    source,
                })?;
            out.insert(field.clone(), amount.to_json());
        }
        Ok(out)
    }
}
