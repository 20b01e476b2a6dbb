//! Root key custody.
//!
//! Per-entry keys are derived from a single device root key, which must never
//! be stored as plaintext.  [`KeyCustody`] abstracts over the backend that
//! holds it:
//!
//! - **macOS**: Keychain Services via `security-framework`
//! - **iOS / Android**: a host-provided adapter around the Keychain or
//!   Keystore, implemented outside this crate
//! - **Fallback**: [`FileKeychain`], the root key wrapped with a
//!   device-derived key
//! - **Tests**: [`MemoryKeychain`]
//!
//! The file fallback is weaker than real key custody: anyone with access to
//! the same machine and user account can rebuild the wrapping key.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{Result, StorageError};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over platform-specific custody of the device root key.
pub trait KeyCustody: Send + Sync {
    /// Retrieve the root key.
    ///
    /// Returns [`StorageError::RootKeyNotFound`] if none has been stored.
    fn get_root_key(&self) -> Result<Zeroizing<Vec<u8>>>;

    /// Store (or overwrite) the root key.
    fn set_root_key(&self, key: &[u8]) -> Result<()>;

    fn has_root_key(&self) -> Result<bool>;

    /// Delete the root key.  Every stored entry becomes unreadable.
    fn delete_root_key(&self) -> Result<()>;
}

/// Load the root key from `custody`, generating and storing one on first
/// use.
pub fn load_or_create_root_key(custody: &dyn KeyCustody) -> Result<Zeroizing<Vec<u8>>> {
    match custody.get_root_key() {
        Ok(key) => Ok(key),
        Err(StorageError::RootKeyNotFound) => {
            let key = crypto::generate_root_key()?;
            custody.set_root_key(&key)?;
            tracing::info!("generated new device root key");
            Ok(key)
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// In-memory custody
// ---------------------------------------------------------------------------

/// Keeps the root key in process memory only.
#[derive(Default)]
pub struct MemoryKeychain {
    key: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyCustody for MemoryKeychain {
    fn get_root_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StorageError::RootKeyNotFound)
    }

    fn set_root_key(&self, key: &[u8]) -> Result<()> {
        *self.key.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Zeroizing::new(key.to_vec()));
        Ok(())
    }

    fn has_root_key(&self) -> Result<bool> {
        Ok(self
            .key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some())
    }

    fn delete_root_key(&self) -> Result<()> {
        *self.key.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-based fallback
// ---------------------------------------------------------------------------

/// Application pepper mixed into the device-derived wrapping key.  Changing
/// this invalidates every stored root key file.
const APP_PEPPER: &[u8] = b"secure-storage-root-key-v1";

/// Stores the root key wrapped with a device-derived key.
///
/// File layout (binary):
/// ```text
/// [32 bytes: PBKDF2 salt]
/// [12 bytes: AES-256-GCM nonce]
/// [remaining: ciphertext + 16-byte tag]
/// ```
pub struct FileKeychain {
    key_file: PathBuf,
}

impl FileKeychain {
    /// Store the root key at `key_file`.  Parent directories are created on
    /// first write.
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
        }
    }

    /// Default key file location: `<data_dir>/root.key`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("root.key")
    }

    /// Derive the wrapping key from hostname, username and `salt`.
    fn device_derived_key(salt: &[u8]) -> Zeroizing<[u8; crypto::KEY_LEN]> {
        let hostname = Self::hostname();
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".into());

        let mut material =
            Zeroizing::new(Vec::with_capacity(hostname.len() + username.len() + APP_PEPPER.len()));
        material.extend_from_slice(hostname.as_bytes());
        material.extend_from_slice(username.as_bytes());
        material.extend_from_slice(APP_PEPPER);

        let mut key = Zeroizing::new([0u8; crypto::KEY_LEN]);
        crypto::derive_key_with_salt(&material, salt, &mut key);
        key
    }

    fn hostname() -> String {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/etc/hostname")
                .map(|s| s.trim().to_string())
                .or_else(|_| std::env::var("HOSTNAME"))
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown-host".into())
        }

        #[cfg(not(unix))]
        {
            std::env::var("COMPUTERNAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "unknown-host".into())
        }
    }
}

impl KeyCustody for FileKeychain {
    fn get_root_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        if !self.key_file.exists() {
            return Err(StorageError::RootKeyNotFound);
        }

        let data = std::fs::read(&self.key_file)?;
        if data.len() < crypto::SALT_LEN + crypto::NONCE_LEN_BYTES + crypto::TAG_LEN {
            return Err(StorageError::KeyCustody {
                reason: "root key file is truncated".into(),
            });
        }

        let (salt, sealed) = data.split_at(crypto::SALT_LEN);
        let wrapping_key = Self::device_derived_key(salt);
        let root_key = crypto::decrypt(sealed, wrapping_key.as_slice())?;

        tracing::debug!(path = %self.key_file.display(), "loaded root key from file");
        Ok(root_key)
    }

    fn set_root_key(&self, key: &[u8]) -> Result<()> {
        let salt = crypto::random_bytes(crypto::SALT_LEN)?;
        let wrapping_key = Self::device_derived_key(&salt);
        let sealed = crypto::encrypt(key, wrapping_key.as_slice())?;

        let mut data = Vec::with_capacity(salt.len() + sealed.len());
        data.extend_from_slice(&salt);
        data.extend_from_slice(&sealed);

        if let Some(parent) = self.key_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a crash never leaves a half-written key.
        let tmp = self.key_file.with_extension("key.tmp");
        std::fs::write(&tmp, &data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &self.key_file)?;

        tracing::info!(path = %self.key_file.display(), "stored root key in file");
        Ok(())
    }

    fn has_root_key(&self) -> Result<bool> {
        Ok(self.key_file.exists())
    }

    fn delete_root_key(&self) -> Result<()> {
        if self.key_file.exists() {
            std::fs::remove_file(&self.key_file)?;
            tracing::info!(path = %self.key_file.display(), "deleted root key file");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// macOS Keychain Services
// ---------------------------------------------------------------------------

/// `errSecItemNotFound`.
#[cfg(target_os = "macos")]
const MACOS_ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;

/// Keeps the root key as a generic password in the login keychain.
#[cfg(target_os = "macos")]
pub struct MacOSKeychain {
    service_name: String,
    account_name: String,
}

#[cfg(target_os = "macos")]
impl MacOSKeychain {
    const DEFAULT_SERVICE: &'static str = "secure-storage";
    const DEFAULT_ACCOUNT: &'static str = "root-key";

    pub fn new() -> Self {
        Self::with_names(Self::DEFAULT_SERVICE, Self::DEFAULT_ACCOUNT)
    }

    /// Use custom keychain names, e.g. to keep test runs apart.
    pub fn with_names(service: &str, account: &str) -> Self {
        Self {
            service_name: service.to_string(),
            account_name: account.to_string(),
        }
    }
}

#[cfg(target_os = "macos")]
impl Default for MacOSKeychain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "macos")]
impl KeyCustody for MacOSKeychain {
    fn get_root_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        use security_framework::passwords::get_generic_password;

        match get_generic_password(&self.service_name, &self.account_name) {
            Ok(data) => Ok(Zeroizing::new(data)),
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => {
                Err(StorageError::RootKeyNotFound)
            }
            Err(e) => Err(StorageError::KeyCustody {
                reason: format!("macOS keychain read failed: {e}"),
            }),
        }
    }

    fn set_root_key(&self, key: &[u8]) -> Result<()> {
        use security_framework::passwords::set_generic_password;

        set_generic_password(&self.service_name, &self.account_name, key).map_err(|e| {
            StorageError::KeyCustody {
                reason: format!("macOS keychain write failed: {e}"),
            }
        })?;

        tracing::info!(service = %self.service_name, "stored root key in macOS keychain");
        Ok(())
    }

    fn has_root_key(&self) -> Result<bool> {
        match self.get_root_key() {
            Ok(_) => Ok(true),
            Err(StorageError::RootKeyNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn delete_root_key(&self) -> Result<()> {
        use security_framework::passwords::delete_generic_password;

        match delete_generic_password(&self.service_name, &self.account_name) {
            Ok(()) => Ok(()),
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => Ok(()),
            Err(e) => Err(StorageError::KeyCustody {
                reason: format!("macOS keychain delete failed: {e}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Best available key custody for the current platform.
///
/// `data_dir` is only used by the file fallback.
#[cfg_attr(target_os = "macos", allow(unused_variables))]
pub fn platform_keychain(data_dir: &Path) -> Box<dyn KeyCustody> {
    #[cfg(target_os = "macos")]
    {
        tracing::info!("using macOS Keychain Services for root key custody");
        Box::new(MacOSKeychain::new())
    }
    #[cfg(not(target_os = "macos"))]
    {
        let path = FileKeychain::default_path(data_dir);
        tracing::info!(path = %path.display(), "using file-based root key custody");
        Box::new(FileKeychain::new(path))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_keychain_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(FileKeychain::default_path(dir.path()));

        assert!(!keychain.has_root_key().unwrap());
        assert!(matches!(
            keychain.get_root_key(),
            Err(StorageError::RootKeyNotFound)
        ));

        let key = crypto::generate_root_key().unwrap();
        keychain.set_root_key(&key).unwrap();
        assert!(keychain.has_root_key().unwrap());
        assert_eq!(keychain.get_root_key().unwrap().as_slice(), key.as_slice());

        keychain.delete_root_key().unwrap();
        assert!(!keychain.has_root_key().unwrap());
    }

    #[test]
    fn file_keychain_does_not_store_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("root.key");
        let keychain = FileKeychain::new(&path);

        let key = [0x5A_u8; crypto::KEY_LEN];
        keychain.set_root_key(&key).unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(key.len()).any(|w| w == key));
    }

    #[test]
    fn truncated_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.key");
        std::fs::write(&path, [0u8; 8]).unwrap();

        let result = FileKeychain::new(&path).get_root_key();
        assert!(matches!(result, Err(StorageError::KeyCustody { .. })));
    }

    #[test]
    fn load_or_create_is_stable() {
        let custody = MemoryKeychain::new();
        let first = load_or_create_root_key(&custody).unwrap();
        let second = load_or_create_root_key(&custody).unwrap();
        assert_eq!(first.len(), crypto::KEY_LEN);
        assert_eq!(first.as_slice(), second.as_slice());
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn platform_keychain_uses_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let custody = platform_keychain(dir.path());

        load_or_create_root_key(custody.as_ref()).unwrap();
        assert!(FileKeychain::default_path(dir.path()).exists());
    }
}
