//! Key derivation: PBKDF2 user keys and HMAC envelope keys.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::CryptoError;

/// Byte length of every derived key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Lowest PBKDF2 round count accepted anywhere in the crate.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Round count used when none is configured.
pub const DEFAULT_ITERATIONS: u32 = MIN_ITERATIONS;

/// A derived 256-bit key, zeroed when dropped.
pub type DerivedKey = Zeroizing<[u8; KEY_LEN]>;

type HmacSha256 = Hmac<Sha256>;

/// The operator-held master secret.
///
/// Supplied once at process start and injected into [`super::FieldCipher`].
/// The bytes are zeroed on drop and never printed.
pub struct MasterSecret(Zeroizing<Vec<u8>>);

impl MasterSecret {
    /// Wrap raw secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Configuration`] if `bytes` is empty.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(bytes.into());
        if bytes.is_empty() {
            return Err(CryptoError::Configuration(
                "master secret must not be empty".into(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Decode a standard-base64 master secret, as found in the environment or
    /// in a Secrets Manager string secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Configuration`] if the input is not base64 or
    /// decodes to nothing.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Configuration("master secret is not valid base64".into()))?;
        Self::new(bytes.to_vec())
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret([REDACTED])")
    }
}

/// Stretch a user's long-term secret into a value-specific key.
///
/// PBKDF2-HMAC-SHA256 with `iterations` rounds over `salt`.
///
/// # Errors
///
/// Returns [`CryptoError::Configuration`] if `secret` is empty or
/// `iterations` is below [`MIN_ITERATIONS`]. A weak default key is never
/// derived.
pub fn derive_user_key(
    secret: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<DerivedKey, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::Configuration(
            "user secret must not be empty".into(),
        ));
    }
    if iterations < MIN_ITERATIONS {
        return Err(CryptoError::Configuration(format!(
            "kdf iterations must be at least {MIN_ITERATIONS}"
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut key[..]);
    Ok(key)
}

/// Bind a user key to the master secret: `HMAC-SHA256(master, user_key)`.
///
/// Neither input alone is enough to reproduce the output.
pub fn derive_envelope_key(
    user_key: &[u8; KEY_LEN],
    master: &MasterSecret,
) -> Result<DerivedKey, CryptoError> {
    let mut mac =
        HmacSha256::new_from_slice(master.expose()).map_err(|_| CryptoError::Derivation)?;
    mac.update(user_key);
    let digest = mac.finalize().into_bytes();

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&digest);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(bytes: &[u8]) -> MasterSecret {
        MasterSecret::new(bytes.to_vec()).unwrap()
    }

    #[test]
    fn user_key_is_deterministic() {
        let a = derive_user_key(b"pw1", b"0123456789abcdef", MIN_ITERATIONS).unwrap();
        let b = derive_user_key(b"pw1", b"0123456789abcdef", MIN_ITERATIONS).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn user_key_depends_on_salt_and_secret() {
        let base = derive_user_key(b"pw1", b"salt-one-16bytes", MIN_ITERATIONS).unwrap();
        let other_salt = derive_user_key(b"pw1", b"salt-two-16bytes", MIN_ITERATIONS).unwrap();
        let other_secret = derive_user_key(b"pw2", b"salt-one-16bytes", MIN_ITERATIONS).unwrap();
        assert_ne!(*base, *other_salt);
        assert_ne!(*base, *other_secret);
    }

    #[test]
    fn empty_secret_is_configuration_error() {
        let err = derive_user_key(b"", b"salt", MIN_ITERATIONS).unwrap_err();
        assert!(matches!(err, CryptoError::Configuration(_)));
    }

    #[test]
    fn low_iteration_count_rejected() {
        let err = derive_user_key(b"pw", b"salt", 1_000).unwrap_err();
        assert!(matches!(err, CryptoError::Configuration(_)));
    }

    #[test]
    fn envelope_key_needs_both_inputs() {
        let user_a = [0x11u8; KEY_LEN];
        let user_b = [0x22u8; KEY_LEN];
        let m1 = master(b"master-one");
        let m2 = master(b"master-two");

        let k = derive_envelope_key(&user_a, &m1).unwrap();
        assert_eq!(*k, *derive_envelope_key(&user_a, &m1).unwrap());
        assert_ne!(*k, *derive_envelope_key(&user_b, &m1).unwrap());
        assert_ne!(*k, *derive_envelope_key(&user_a, &m2).unwrap());
        assert_ne!(&k[..], &user_a[..]);
    }

    #[test]
    fn empty_master_secret_rejected() {
        assert!(matches!(
            MasterSecret::new(Vec::new()),
            Err(CryptoError::Configuration(_))
        ));
        assert!(matches!(
            MasterSecret::from_base64("   "),
            Err(CryptoError::Configuration(_))
        ));
    }

    #[test]
    fn master_secret_from_base64() {
        let m = MasterSecret::from_base64("c2VjcmV0").unwrap();
        assert_eq!(m.expose(), b"secret");
        assert!(MasterSecret::from_base64("not base64!").is_err());
    }

    #[test]
    fn master_secret_redacted_in_debug() {
        let m = master(b"do-not-print");
        let printed = format!("{m:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("do-not-print"));
    }
}
