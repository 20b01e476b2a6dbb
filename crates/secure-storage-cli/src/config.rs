//! `securestore.toml` loading.
//!
//! ```toml
//! data_dir = "data"
//!
//! [store]
//! challenge_timeout_ms = 60000
//! hardware_fallback = "deny"
//!
//! [store.defaults]
//! service = "default"
//!
//! [device]
//! biometry = "TouchID"
//! secure_hardware = true
//! passcode_hash = "..."
//! ```
//!
//! A missing file yields the defaults.  Any other read or parse error is
//! reported.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use secure_storage::crypto::PasscodeHash;
use secure_storage::{BiometryType, DeviceCapabilities, StoreConfig};
use serde::Deserialize;

/// Default directory for the entry database and root key file.
pub const DEFAULT_DATA_DIR: &str = "data";

/// File name of the entry database inside the data directory.
pub const DB_FILE: &str = "secure.db";

/// Top-level configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub data_dir: Option<PathBuf>,
    pub store: StoreConfig,
    pub device: DeviceConfig,
}

/// What the terminal reports about the local device.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Biometry advertised to callers.  The terminal cannot perform a
    /// biometric match, so such challenges fail.
    pub biometry: Option<BiometryType>,

    pub secure_hardware: bool,

    /// Output of `securestore set-passcode`.
    pub passcode_hash: Option<String>,
}

impl CliConfig {
    /// Load from `path`, falling back to defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Entry database path: `override_db`, else `<data_dir>/secure.db`.
    pub fn db_path(&self, override_db: Option<&Path>) -> PathBuf {
        match override_db {
            Some(path) => path.to_path_buf(),
            None => self.data_dir().join(DB_FILE),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }
}

impl DeviceConfig {
    /// Decode the configured passcode hash, if any.
    pub fn passcode(&self) -> Result<Option<PasscodeHash>> {
        self.passcode_hash
            .as_deref()
            .map(PasscodeHash::decode)
            .transpose()
            .context("invalid [device] passcode_hash")
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default()
            .with_passcode(self.passcode_hash.is_some())
            .with_secure_hardware(self.secure_hardware);
        if let Some(biometry) = self.biometry {
            // The terminal has no enrollment data; a fixed set id keeps
            // `BiometryCurrentSet` entries readable across runs.
            caps = caps.with_biometry(biometry, "terminal");
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secure_storage::HardwareFallback;

    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.store, StoreConfig::default());
        assert_eq!(config.db_path(None), PathBuf::from("data/secure.db"));
        assert!(!config.device.capabilities().passcode_set);
    }

    #[test]
    fn parses_all_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("securestore.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/securestore"

[store]
challenge_timeout_ms = 15000
hardware_fallback = "software_only"

[store.defaults]
service = "com.example"

[device]
biometry = "FaceID"
secure_hardware = true
"#,
        )
        .unwrap();

        let config = CliConfig::load(&path).unwrap();
        assert_eq!(config.store.challenge_timeout(), Duration::from_secs(15));
        assert_eq!(config.store.hardware_fallback, HardwareFallback::SoftwareOnly);
        assert_eq!(config.store.defaults.service, "com.example");
        assert_eq!(
            config.db_path(None),
            PathBuf::from("/var/lib/securestore/secure.db")
        );
        assert_eq!(
            config.db_path(Some(Path::new("other.db"))),
            PathBuf::from("other.db")
        );

        let caps = config.device.capabilities();
        assert_eq!(caps.biometry, Some(BiometryType::FaceId));
        assert!(caps.secure_hardware);
        assert!(!caps.passcode_set);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[store\nchallenge_timeout_ms = ").unwrap();
        assert!(CliConfig::load(&path).is_err());
    }

    #[test]
    fn invalid_passcode_hash_is_reported() {
        let device = DeviceConfig {
            passcode_hash: Some("not base64!".into()),
            ..DeviceConfig::default()
        };
        assert!(device.passcode().is_err());
        assert!(device.capabilities().passcode_set);
    }
}
