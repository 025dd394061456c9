//! AES-256-GCM-SIV encryption and decryption of individual amounts.
//!
//! Every call draws a fresh salt and nonce from the OS CSPRNG, so encrypting
//! the same amount twice never yields the same stored value and equal amounts
//! cannot be correlated across records.
//!
//! # Stored shape
//!
//! ```text
//! {"v":1,"n":100000,"ciphertext":"<b64>","iv":"<b64>","tag":"<b64>","salt":"<b64>",
//!  "escrow":{"ciphertext":"<b64>","iv":"<b64>","tag":"<b64>"}}
//! ```
//!
//! `n` is the PBKDF2 round count the value key was derived with. Values
//! written before it existed omit it and were derived with
//! [`MIN_ITERATIONS`]. `escrow` is present only when the value was written
//! with a recovery salt.

use std::sync::Arc;

use aes_gcm_siv::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use super::kdf::{
    derive_envelope_key, derive_user_key, DerivedKey, MasterSecret, DEFAULT_ITERATIONS, KEY_LEN,
    MIN_ITERATIONS,
};
use super::{Amount, CryptoError};

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the detached authentication tag.
pub const TAG_LEN: usize = 16;

/// Byte length of a key-derivation salt.
pub const SALT_LEN: usize = 16;

/// Associated data bound into every tag.
pub const CONTEXT: &[u8] = b"financial-data";

/// Version number written into every stored value.
pub const FORMAT_VERSION: u8 = 1;

/// Largest round count accepted from a stored value.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// Round count for escrow keys. Fixed so that changing the configured cost
/// never strands escrow copies.
pub const ESCROW_ITERATIONS: u32 = MIN_ITERATIONS;

/// A key-derivation salt. Not secret.
pub type Salt = [u8; SALT_LEN];

/// Draw a fresh random salt from the OS CSPRNG.
pub fn random_salt() -> Salt {
    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn random_nonce() -> [u8; NONCE_LEN] {
    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

// ---------------------------------------------------------------------------
// Stored value
// ---------------------------------------------------------------------------

/// The persisted form of a protected amount.
///
/// Carries no key material. It is meaningful only together with the secret
/// its key was derived from and the [`CONTEXT`] string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireValue", into = "WireValue")]
pub struct EncryptedValue {
    /// Encrypted canonical decimal string.
    pub ciphertext: Vec<u8>,
    /// Per-encryption nonce.
    pub iv: [u8; NONCE_LEN],
    /// Authentication tag over `ciphertext` and [`CONTEXT`].
    pub tag: [u8; TAG_LEN],
    /// Salt the value key was derived with.
    pub salt: Salt,
    /// PBKDF2 rounds the value key was derived with.
    pub iterations: u32,
    /// Copy of the plaintext sealed under the user's escrow key, if any.
    pub escrow: Option<EscrowEnvelope>,
}

/// The escrowed copy of a value, sealed under an [`EscrowKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowEnvelope {
    /// Encrypted canonical decimal string.
    pub ciphertext: Vec<u8>,
    /// Nonce used for the escrow seal.
    pub iv: [u8; NONCE_LEN],
    /// Authentication tag over `ciphertext` and [`CONTEXT`].
    pub tag: [u8; TAG_LEN],
}

impl EncryptedValue {
    /// `true` if `value` has the shape of a stored encrypted value.
    ///
    /// Shape only: the contents are validated by [`EncryptedValue::from_json`].
    pub fn is_encrypted(value: &Value) -> bool {
        value
            .as_object()
            .is_some_and(|obj| obj.contains_key("ciphertext"))
    }

    /// Parse a stored JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Format`] for an unknown version, bad base64,
    /// wrong field lengths, or unexpected fields.
    pub fn from_json(value: &Value) -> Result<Self, CryptoError> {
        let wire = WireValue::deserialize(value)
            .map_err(|e| CryptoError::Format(format!("malformed encrypted value: {e}")))?;
        Self::try_from(wire)
    }

    /// Render the stored JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Format`] if serialisation fails.
    pub fn to_json(&self) -> Result<Value, CryptoError> {
        serde_json::to_value(self)
            .map_err(|e| CryptoError::Format(format!("cannot encode encrypted value: {e}")))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireValue {
    v: u8,
    #[serde(default)]
    n: Option<u32>,
    ciphertext: String,
    iv: String,
    tag: String,
    salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escrow: Option<WireEscrow>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEscrow {
    ciphertext: String,
    iv: String,
    tag: String,
}

impl TryFrom<WireValue> for EncryptedValue {
    type Error = CryptoError;

    fn try_from(wire: WireValue) -> Result<Self, Self::Error> {
        if wire.v != FORMAT_VERSION {
            return Err(CryptoError::Format(format!(
                "unsupported encrypted value version {}",
                wire.v
            )));
        }
        let iterations = wire.n.unwrap_or(MIN_ITERATIONS);
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations) {
            return Err(CryptoError::Format(format!(
                "kdf round count {iterations} is out of range"
            )));
        }
        let escrow = match wire.escrow {
            Some(e) => Some(EscrowEnvelope {
                ciphertext: decode("escrow.ciphertext", &e.ciphertext)?,
                iv: decode_fixed("escrow.iv", &e.iv)?,
                tag: decode_fixed("escrow.tag", &e.tag)?,
            }),
            None => None,
        };
        Ok(Self {
            ciphertext: decode("ciphertext", &wire.ciphertext)?,
            iv: decode_fixed("iv", &wire.iv)?,
            tag: decode_fixed("tag", &wire.tag)?,
            salt: decode_fixed("salt", &wire.salt)?,
            iterations,
            escrow,
        })
    }
}

impl From<EncryptedValue> for WireValue {
    fn from(value: EncryptedValue) -> Self {
        Self {
            v: FORMAT_VERSION,
            n: Some(value.iterations),
            ciphertext: STANDARD.encode(&value.ciphertext),
            iv: STANDARD.encode(value.iv),
            tag: STANDARD.encode(value.tag),
            salt: STANDARD.encode(value.salt),
            escrow: value.escrow.map(|e| WireEscrow {
                ciphertext: STANDARD.encode(&e.ciphertext),
                iv: STANDARD.encode(e.iv),
                tag: STANDARD.encode(e.tag),
            }),
        }
    }
}

fn decode(field: &str, encoded: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(encoded)
        .map_err(|_| CryptoError::Format(format!("{field} is not valid base64")))
}

fn decode_fixed<const N: usize>(field: &str, encoded: &str) -> Result<[u8; N], CryptoError> {
    decode(field, encoded)?
        .try_into()
        .map_err(|_| CryptoError::Format(format!("{field} must be {N} bytes")))
}

// ---------------------------------------------------------------------------
// Keys held by callers
// ---------------------------------------------------------------------------

/// Key that seals and opens escrow copies for one user.
///
/// Derived from the master secret and the user's durable recovery salt.
pub struct EscrowKey(DerivedKey);

impl std::fmt::Debug for EscrowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EscrowKey([REDACTED])")
    }
}

/// A user's secret, plus their escrow key when a recovery salt is assigned.
///
/// Build one per request or batch with [`FieldCipher::credential`]; the escrow
/// key is derived once here rather than per field.
pub struct Credential {
    secret: Zeroizing<String>,
    escrow: Option<EscrowKey>,
}

impl Credential {
    /// Whether values written with this credential get an escrow copy.
    pub fn has_escrow(&self) -> bool {
        self.escrow.is_some()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"[REDACTED]")
            .field("escrow", &self.escrow.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Cipher
// ---------------------------------------------------------------------------

/// Encrypts and decrypts single amounts.
///
/// Holds the master secret and the KDF cost. Cheap to clone and safe to share
/// across threads; no call mutates shared state.
#[derive(Clone, Debug)]
pub struct FieldCipher {
    master: Arc<MasterSecret>,
    iterations: u32,
}

impl FieldCipher {
    /// Create a cipher using the default KDF cost.
    pub fn new(master: MasterSecret) -> Self {
        Self {
            master: Arc::new(master),
            iterations: DEFAULT_ITERATIONS,
        }
    }

    /// Create a cipher with an explicit PBKDF2 round count.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Configuration`] if `iterations` is outside
    /// `MIN_ITERATIONS..=MAX_ITERATIONS`.
    pub fn with_iterations(master: MasterSecret, iterations: u32) -> Result<Self, CryptoError> {
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations) {
            return Err(CryptoError::Configuration(format!(
                "kdf iterations must be between {MIN_ITERATIONS} and {MAX_ITERATIONS}"
            )));
        }
        Ok(Self {
            master: Arc::new(master),
            iterations,
        })
    }

    /// Build a [`Credential`] for `user_secret`.
    ///
    /// With `recovery_salt`, values written through the credential also get
    /// an escrow copy.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Configuration`] if `user_secret` is empty.
    pub fn credential(
        &self,
        user_secret: &str,
        recovery_salt: Option<&Salt>,
    ) -> Result<Credential, CryptoError> {
        if user_secret.is_empty() {
            return Err(CryptoError::Configuration(
                "user secret must not be empty".into(),
            ));
        }
        let escrow = recovery_salt
            .map(|salt| self.escrow_key(salt))
            .transpose()?;
        Ok(Credential {
            secret: Zeroizing::new(user_secret.to_owned()),
            escrow,
        })
    }

    /// Derive a user's escrow key from the standing master secret.
    pub fn escrow_key(&self, recovery_salt: &Salt) -> Result<EscrowKey, CryptoError> {
        self.escrow_key_with(&self.master, recovery_salt)
    }

    /// Derive a user's escrow key from an explicitly supplied master secret.
    ///
    /// The master secret stands in for the user secret in the first step and
    /// keys the envelope in the second. Always uses [`ESCROW_ITERATIONS`].
    pub fn escrow_key_with(
        &self,
        master: &MasterSecret,
        recovery_salt: &Salt,
    ) -> Result<EscrowKey, CryptoError> {
        let user_key = derive_user_key(master.expose(), recovery_salt, ESCROW_ITERATIONS)?;
        derive_envelope_key(&user_key, master).map(EscrowKey)
    }

    /// Encrypt `value` for `user_secret` without an escrow copy.
    pub fn encrypt(&self, value: Amount, user_secret: &str) -> Result<EncryptedValue, CryptoError> {
        let credential = self.credential(user_secret, None)?;
        self.encrypt_for(value, &credential)
    }

    /// Encrypt `value` under a fresh salt and nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Seal`] on an internal AEAD error (should be
    /// unreachable with a valid key and nonce).
    pub fn encrypt_for(
        &self,
        value: Amount,
        credential: &Credential,
    ) -> Result<EncryptedValue, CryptoError> {
        let salt = random_salt();
        let key = self.value_key(credential.secret.as_bytes(), &salt, self.iterations)?;
        let plaintext = Zeroizing::new(value.to_string());

        let (iv, ciphertext, tag) = seal(&key, plaintext.as_bytes())?;
        let escrow = match &credential.escrow {
            Some(escrow_key) => {
                let (iv, ciphertext, tag) = seal(&escrow_key.0, plaintext.as_bytes())?;
                Some(EscrowEnvelope { ciphertext, iv, tag })
            }
            None => None,
        };

        Ok(EncryptedValue {
            ciphertext,
            iv,
            tag,
            salt,
            iterations: self.iterations,
            escrow,
        })
    }

    /// Decrypt `data` with the secret it was written for.
    ///
    /// The key is derived with the round count stored in `data`, not the
    /// cipher's current setting.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AuthenticationFailure`] if the tag does not
    /// verify and [`CryptoError::Format`] if the payload is not an amount.
    /// Never returns a default value.
    pub fn decrypt(&self, data: &EncryptedValue, user_secret: &str) -> Result<Amount, CryptoError> {
        let key = self.value_key(user_secret.as_bytes(), &data.salt, data.iterations)?;
        open(&key, &data.iv, &data.ciphertext, &data.tag)
    }

    /// Decrypt the escrow copy of `data` without the user secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoEscrow`] if `data` has no escrow copy and
    /// [`CryptoError::AuthenticationFailure`] if `key` does not open it.
    pub fn recover(&self, data: &EncryptedValue, key: &EscrowKey) -> Result<Amount, CryptoError> {
        let escrow = data.escrow.as_ref().ok_or(CryptoError::NoEscrow)?;
        open(&key.0, &escrow.iv, &escrow.ciphertext, &escrow.tag)
    }

    fn value_key(
        &self,
        secret: &[u8],
        salt: &Salt,
        iterations: u32,
    ) -> Result<DerivedKey, CryptoError> {
        let user_key = derive_user_key(secret, salt, iterations)?;
        derive_envelope_key(&user_key, &self.master)
    }
}

fn build_cipher(key: &[u8; KEY_LEN]) -> Aes256GcmSiv {
    Aes256GcmSiv::new(GenericArray::from_slice(key))
}

fn seal(
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>, [u8; TAG_LEN]), CryptoError> {
    let cipher = build_cipher(key);
    let iv = random_nonce();
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), CONTEXT, &mut buffer)
        .map_err(|_| CryptoError::Seal)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok((iv, buffer, tag_bytes))
}

fn open(
    key: &[u8; KEY_LEN],
    iv: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Amount, CryptoError> {
    let cipher = build_cipher(key);
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(iv),
            CONTEXT,
            &mut *buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CryptoError::AuthenticationFailure)?;

    std::str::from_utf8(&buffer)
        .map_err(|_| CryptoError::Format("payload is not UTF-8".into()))?
        .parse()
}
