//! Field-level encryption primitives for monetary amounts.
//!
//! No storage or HTTP dependencies.
//!
//! # Key schedule
//!
//! ```text
//! user_key     = PBKDF2-HMAC-SHA256(user_secret, per-value salt, >= 100k rounds)
//! envelope_key = HMAC-SHA256(key = master_secret, msg = user_key)
//! ```
//!
//! The envelope key seals the amount's canonical decimal string with
//! AES-256-GCM-SIV under the associated data `"financial-data"`. When the
//! caller's [`Credential`] carries an escrow key, the same plaintext is also
//! sealed under a key derived from the master secret and the user's durable
//! recovery salt, so an operator can recover it without the user secret.

pub mod amount;
pub mod cipher;
pub mod kdf;

pub use amount::Amount;
pub use cipher::{
    random_salt, Credential, EncryptedValue, EscrowEnvelope, EscrowKey, FieldCipher, Salt,
    CONTEXT, SALT_LEN,
};
pub use kdf::{derive_envelope_key, derive_user_key, MasterSecret, KEY_LEN};

use thiserror::Error;

/// Errors produced by the crypto layer.
#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    /// A secret is missing or empty, or the KDF cost is below the floor.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The MAC could not be keyed. Unreachable for well-formed inputs.
    #[error("key derivation failed")]
    Derivation,

    /// Tag verification failed: wrong secret, tampered data, or bit-rot.
    #[error("authentication failed")]
    AuthenticationFailure,

    /// A stored value or decrypted payload is not in the expected format.
    #[error("invalid format: {0}")]
    Format(String),

    /// The AEAD refused to seal. Unreachable with a valid key and nonce.
    #[error("aead seal failed")]
    Seal,

    /// The value was written without an escrow copy and cannot be recovered
    /// with the master secret alone.
    #[error("value has no escrow copy")]
    NoEscrow,
}

impl CryptoError {
    /// Short, value-free category name suitable for logs and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            CryptoError::Configuration(_) => "configuration_error",
            CryptoError::Derivation => "derivation_error",
            CryptoError::AuthenticationFailure => "authentication_failure",
            CryptoError::Format(_) => "format_error",
            CryptoError::Seal => "seal_error",
            CryptoError::NoEscrow => "no_escrow",
        }
    }

    /// `true` for failures that affect a single stored value and may be
    /// degraded at the field level instead of failing the whole operation.
    pub fn is_field_recoverable(&self) -> bool {
        matches!(self, CryptoError::AuthenticationFailure | CryptoError::Format(_))
    }
}
