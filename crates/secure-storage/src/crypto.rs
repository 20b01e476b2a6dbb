//! Crypto provider: AES-256-GCM, HKDF per-entry keys and PBKDF2 passcodes.
//!
//! All primitives come from `ring`:
//!
//! - **Encryption/decryption**: AES-256-GCM authenticated encryption with a
//!   randomly generated 96-bit nonce prepended to the output.
//! - **Per-entry keys**: HKDF-SHA256 expands the device root key with the
//!   entry's `(service, key)` as context, so no two entries share a key.
//! - **Passcodes**: PBKDF2-HMAC-SHA256 hashes for passcode authenticators.
//!
//! Every function here is stateless apart from the system CSPRNG.

use std::num::NonZeroU32;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hkdf, pbkdf2};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Result, StorageError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Length of the PBKDF2 salt in bytes.
pub const SALT_LEN: usize = 32;

/// 600,000 iterations per OWASP 2023 for HMAC-SHA256.
const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(600_000) {
    Some(n) => n,
    None => unreachable!(),
};

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

/// HKDF salt for per-entry key derivation.  Changing this invalidates every
/// stored entry.
const HKDF_SALT: &[u8] = b"secure-storage-entry-key-v1";

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// Yields exactly one nonce, then errors.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Per-entry keys
// ---------------------------------------------------------------------------

/// A 256-bit key scoped to a single `(service, key)` entry.
///
/// The key bytes are wiped from memory when the value is dropped.
pub struct EntryKey(Zeroizing<[u8; KEY_LEN]>);

impl EntryKey {
    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl std::fmt::Debug for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EntryKey(..)")
    }
}

struct KeyLen(usize);

impl hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the key for entry `(service, key)` from the device `root_key`.
///
/// Both identifiers are length-prefixed in the HKDF info so that
/// `("ab", "c")` and `("a", "bc")` never collide.
///
/// # Errors
///
/// Returns [`StorageError::KeyDerivation`] if the root key is empty or HKDF
/// expansion fails.
pub fn derive_entry_key(root_key: &[u8], service: &str, key: &str) -> Result<EntryKey> {
    if root_key.is_empty() {
        return Err(StorageError::KeyDerivation {
            reason: "root key is empty".into(),
        });
    }

    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, HKDF_SALT).extract(root_key);

    let service_len = (service.len() as u64).to_be_bytes();
    let key_len = (key.len() as u64).to_be_bytes();
    let info: [&[u8]; 4] = [&service_len, service.as_bytes(), &key_len, key.as_bytes()];

    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    prk.expand(&info, KeyLen(KEY_LEN))
        .and_then(|okm| okm.fill(out.as_mut_slice()))
        .map_err(|_| StorageError::KeyDerivation {
            reason: "HKDF expansion failed".into(),
        })?;

    Ok(EntryKey(out))
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` with AES-256-GCM under the 256-bit `key`.
///
/// The returned buffer is `nonce || ciphertext || tag`.
///
/// # Errors
///
/// Returns [`StorageError::Encryption`] if the key length is wrong or `ring`
/// reports a failure.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(StorageError::Encryption {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }

    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| StorageError::Encryption {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| StorageError::Encryption {
        reason: "failed to create AES-256-GCM key".into(),
    })?;
    let mut sealing_key = SealingKey::new(unbound_key, SingleNonce(Some(nonce_bytes)));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| StorageError::Encryption {
            reason: "seal_in_place failed".into(),
        })?;

    let mut sealed = Vec::with_capacity(NONCE_LEN_BYTES + in_out.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = sealed.len(),
        "encrypted data"
    );

    Ok(sealed)
}

/// Decrypt a buffer produced by [`encrypt`] under the 256-bit `key`.
///
/// The plaintext is returned in a buffer that is zeroed on drop.
///
/// # Errors
///
/// Returns [`StorageError::Decrypt`] if the key is wrong, the input is too
/// short, or the ciphertext has been tampered with.
pub fn decrypt(sealed: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if key.len() != KEY_LEN {
        return Err(StorageError::Decrypt {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }
    if sealed.len() < NONCE_LEN_BYTES + TAG_LEN {
        return Err(StorageError::Decrypt {
            reason: format!("ciphertext is {} bytes, too short", sealed.len()),
        });
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN_BYTES);
    let mut nonce = [0u8; NONCE_LEN_BYTES];
    nonce.copy_from_slice(nonce_bytes);

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| StorageError::Decrypt {
        reason: "failed to create AES-256-GCM key".into(),
    })?;
    let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce(Some(nonce)));

    let mut in_out = Zeroizing::new(ciphertext.to_vec());
    let plaintext_len = opening_key
        .open_in_place(Aad::empty(), in_out.as_mut_slice())
        .map_err(|_| StorageError::Decrypt {
            reason: "authentication failed: wrong key or corrupted data".into(),
        })?
        .len();
    in_out.truncate(plaintext_len);

    tracing::trace!(
        ciphertext_len = sealed.len(),
        plaintext_len,
        "decrypted data"
    );

    Ok(in_out)
}

// ---------------------------------------------------------------------------
// Passcodes
// ---------------------------------------------------------------------------

/// PBKDF2 hash of a device passcode or application password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasscodeHash {
    salt: [u8; SALT_LEN],
    hash: [u8; KEY_LEN],
}

impl PasscodeHash {
    /// Encode as base64 of `salt || hash`, suitable for config files.
    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(SALT_LEN + KEY_LEN);
        raw.extend_from_slice(&self.salt);
        raw.extend_from_slice(&self.hash);
        BASE64.encode(raw)
    }

    /// Parse the output of [`PasscodeHash::encode`].
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|_| StorageError::InvalidOption {
                field: "passcode_hash",
                value: encoded.to_string(),
            })?;
        if raw.len() != SALT_LEN + KEY_LEN {
            return Err(StorageError::InvalidOption {
                field: "passcode_hash",
                value: encoded.to_string(),
            });
        }

        let mut salt = [0u8; SALT_LEN];
        let mut hash = [0u8; KEY_LEN];
        salt.copy_from_slice(&raw[..SALT_LEN]);
        hash.copy_from_slice(&raw[SALT_LEN..]);
        Ok(Self { salt, hash })
    }
}

impl std::fmt::Debug for PasscodeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasscodeHash(..)")
    }
}

/// Hash `passcode` with PBKDF2-HMAC-SHA256 and a fresh random salt.
///
/// # Errors
///
/// Returns [`StorageError::KeyDerivation`] if salt generation fails.
pub fn hash_passcode(passcode: &[u8]) -> Result<PasscodeHash> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| StorageError::KeyDerivation {
            reason: "failed to generate random salt".into(),
        })?;

    let mut hash = [0u8; KEY_LEN];
    derive_key_with_salt(passcode, &salt, &mut hash);

    tracing::debug!("hashed passcode via PBKDF2");
    Ok(PasscodeHash { salt, hash })
}

/// Derive a 256-bit key from `secret` and a known `salt` with
/// PBKDF2-HMAC-SHA256.
pub fn derive_key_with_salt(secret: &[u8], salt: &[u8], out: &mut [u8; KEY_LEN]) {
    pbkdf2::derive(PBKDF2_ALG, PBKDF2_ITERATIONS, salt, secret, out);
}

/// Check `passcode` against a stored hash in constant time.
pub fn verify_passcode(passcode: &[u8], stored: &PasscodeHash) -> bool {
    pbkdf2::verify(
        PBKDF2_ALG,
        PBKDF2_ITERATIONS,
        &stored.salt,
        passcode,
        &stored.hash,
    )
    .is_ok()
}

// ---------------------------------------------------------------------------
// Random bytes
// ---------------------------------------------------------------------------

/// Generate `len` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns [`StorageError::Internal`] if the system CSPRNG fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| StorageError::Internal("failed to generate random bytes".into()))?;
    Ok(buf)
}

/// Generate a fresh 256-bit device root key.
pub fn generate_root_key() -> Result<Zeroizing<Vec<u8>>> {
    random_bytes(KEY_LEN).map(Zeroizing::new)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_key(service: &str, key: &str) -> EntryKey {
        derive_entry_key(&[7u8; KEY_LEN], service, key).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = entry_key("default", "token");
        let sealed = encrypt(b"hello, secure storage", key.as_bytes()).unwrap();
        let opened = decrypt(&sealed, key.as_bytes()).unwrap();
        assert_eq!(opened.as_slice(), b"hello, secure storage");
    }

    #[test]
    fn ciphertext_carries_nonce_and_tag() {
        let key = entry_key("default", "token");
        let sealed = encrypt(b"abc", key.as_bytes()).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN_BYTES + 3 + TAG_LEN);
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let key = entry_key("default", "token");
        let a = encrypt(b"same", key.as_bytes()).unwrap();
        let b = encrypt(b"same", key.as_bytes()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_with_other_entry_key_fails() {
        let a = entry_key("default", "a");
        let b = entry_key("default", "b");
        let sealed = encrypt(b"secret", a.as_bytes()).unwrap();
        assert!(matches!(
            decrypt(&sealed, b.as_bytes()),
            Err(StorageError::Decrypt { .. })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = entry_key("default", "token");
        let mut sealed = encrypt(b"secret", key.as_bytes()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt(&sealed, key.as_bytes()).is_err());
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let key = entry_key("default", "token");
        let result = decrypt(&[0u8; 10], key.as_bytes());
        assert!(matches!(result, Err(StorageError::Decrypt { .. })));
    }

    #[test]
    fn invalid_key_length_rejected() {
        assert!(matches!(
            encrypt(b"test", &[0u8; 16]),
            Err(StorageError::Encryption { .. })
        ));
    }

    #[test]
    fn entry_keys_are_deterministic_and_scoped() {
        assert_eq!(entry_key("s", "k").as_bytes(), entry_key("s", "k").as_bytes());
        assert_ne!(entry_key("s", "k").as_bytes(), entry_key("t", "k").as_bytes());
        assert_ne!(entry_key("ab", "c").as_bytes(), entry_key("a", "bc").as_bytes());
    }

    #[test]
    fn empty_root_key_rejected() {
        assert!(matches!(
            derive_entry_key(&[], "s", "k"),
            Err(StorageError::KeyDerivation { .. })
        ));
    }

    #[test]
    fn passcode_hash_verify_and_encode() {
        let hash = hash_passcode(b"1234").unwrap();
        assert!(verify_passcode(b"1234", &hash));
        assert!(!verify_passcode(b"4321", &hash));

        let decoded = PasscodeHash::decode(&hash.encode()).unwrap();
        assert_eq!(decoded, hash);
        assert!(PasscodeHash::decode("not base64!").is_err());
    }
}
