//! The public facade: `set_item`, `get_item`, `remove_item`, `get_all_keys`
//! and the capability queries.
//!
//! Each operation resolves the caller's options over [`StoreConfig`],
//! evaluates the access policy, runs the authentication gate when a
//! challenge is required, and only then touches the crypto provider and the
//! entry store.  Nothing is written unless every preceding step succeeded.

use std::sync::Arc;

use tracing::instrument;
use zeroize::Zeroizing;

use crate::config::{ResolvedOptions, StoreConfig, StoreOptions};
use crate::crypto;
use crate::error::{Result, StorageError};
use crate::gate::{AuthenticationGate, GateState};
use crate::keychain::{self, KeyCustody, MemoryKeychain};
use crate::platform::{Authenticator, DeviceCapabilities};
use crate::policy::{self, Decision, DenyReason};
use crate::store::{BackupRecord, EntryPolicy, EntryStore, StoredEntry};
use crate::types::BiometryType;

/// Secure key-value storage with access control and authentication gating.
///
/// `SecureStorage` is `Send + Sync`; share one instance per process through
/// an `Arc`.
///
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use secure_storage::{SecureStorage, StoreConfig, StoreOptions, AccessControl};
/// # use secure_storage::platform::{DeviceCapabilities, ScriptedAuthenticator};
/// # async fn example() -> secure_storage::Result<()> {
/// let device = DeviceCapabilities::default()
///     .with_passcode(true)
///     .with_secure_hardware(true);
/// let storage = SecureStorage::open_in_memory(
///     StoreConfig::default(),
///     Arc::new(ScriptedAuthenticator::new(device)),
/// )?;
///
/// let opts = StoreOptions::new().with_access_control(AccessControl::DevicePasscode);
/// storage.set_item("token", "secret", &opts).await?;
/// assert_eq!(storage.get_item("token", &opts).await?, "secret");
/// # Ok(())
/// # }
/// ```
pub struct SecureStorage {
    config: StoreConfig,
    store: EntryStore,
    authenticator: Arc<dyn Authenticator>,
    gate: AuthenticationGate,
    root_key: Zeroizing<Vec<u8>>,
}

impl SecureStorage {
    /// Assemble the engine.  The root key is loaded from `custody`, or
    /// generated and stored there on first use.
    pub fn new(
        config: StoreConfig,
        store: EntryStore,
        custody: &dyn KeyCustody,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        let root_key = keychain::load_or_create_root_key(custody)?;
        let gate = AuthenticationGate::new(config.challenge_timeout());

        tracing::info!(
            default_service = %config.defaults.service,
            hardware_fallback = ?config.hardware_fallback,
            "secure storage ready"
        );

        Ok(Self {
            config,
            store,
            authenticator,
            gate,
            root_key,
        })
    }

    /// In-memory store with an ephemeral root key (useful for testing).
    pub fn open_in_memory(
        config: StoreConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        Self::new(
            config,
            EntryStore::open_in_memory()?,
            &MemoryKeychain::new(),
            authenticator,
        )
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current state of the authentication gate.
    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    // -- Operations ---------------------------------------------------------

    /// Store `value` under `key`, creating or replacing the entry.
    ///
    /// The requested access control must be satisfiable on this device.
    /// Replacing an entry that is itself access-controlled requires passing
    /// that entry's challenge first.
    #[instrument(skip(self, value, options), fields(service = tracing::field::Empty))]
    pub async fn set_item(&self, key: &str, value: &str, options: &StoreOptions) -> Result<()> {
        let opts = self.config.resolve(options);
        tracing::Span::current().record("service", opts.service.as_str());
        let caps = self.authenticator.capabilities();

        if let Decision::Denied(reason) = policy::evaluate(
            opts.access_control,
            opts.accessible,
            opts.authenticate_type,
            &caps,
            self.config.hardware_fallback,
        ) {
            return Err(deny_error(reason));
        }

        let entry = self.store.lock(&opts.service, key).await;

        match self.store.get(&opts.service, key).await {
            Ok(existing) => {
                if ensure_access_group(&existing, &opts).is_err() {
                    return Err(StorageError::AccessDenied {
                        reason: "entry belongs to another access group".into(),
                    });
                }
                if existing.policy.access_control.is_some() {
                    self.authorize(&existing, &opts, &caps).await?;
                }
            }
            Err(StorageError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let entry_key = crypto::derive_entry_key(&self.root_key, &opts.service, key)?;
        let ciphertext = crypto::encrypt(value.as_bytes(), entry_key.as_bytes())?;

        let biometry_set = opts
            .access_control
            .filter(|ac| ac.binds_biometry_set())
            .and(caps.biometry_set.clone());

        let policy = EntryPolicy {
            access_control: opts.access_control,
            accessible: opts.accessible,
            access_group: opts.access_group.clone(),
            biometry_set,
        };

        self.store.put(&entry, ciphertext, policy).await
    }

    /// Read and decrypt the value stored under `key`.
    ///
    /// The entry's own access policy decides which challenge, if any, is
    /// presented, using the prompt from `options`.
    #[instrument(skip(self, options), fields(service = tracing::field::Empty))]
    pub async fn get_item(&self, key: &str, options: &StoreOptions) -> Result<String> {
        let opts = self.config.resolve(options);
        tracing::Span::current().record("service", opts.service.as_str());

        let entry = self.store.get(&opts.service, key).await?;
        ensure_access_group(&entry, &opts)?;

        let caps = self.authenticator.capabilities();
        self.authorize(&entry, &opts, &caps).await?;

        let entry_key = crypto::derive_entry_key(&self.root_key, &entry.service, &entry.key)?;
        let plaintext = crypto::decrypt(&entry.ciphertext, entry_key.as_bytes())?;

        let value = std::str::from_utf8(&plaintext)
            .map_err(|_| StorageError::Decrypt {
                reason: "stored value is not valid UTF-8".into(),
            })?
            .to_owned();

        tracing::debug!("read entry");
        Ok(value)
    }

    /// Remove the entry stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if there is no such entry.
    #[instrument(skip(self, options), fields(service = tracing::field::Empty))]
    pub async fn remove_item(&self, key: &str, options: &StoreOptions) -> Result<()> {
        let opts = self.config.resolve(options);
        tracing::Span::current().record("service", opts.service.as_str());

        let entry = self.store.lock(&opts.service, key).await;
        if opts.access_group.is_some() {
            let existing = self.store.get(&opts.service, key).await?;
            ensure_access_group(&existing, &opts)?;
        }
        self.store.delete(&entry).await
    }

    /// All keys stored under the resolved service.  Empty if the service has
    /// no entries.
    pub async fn get_all_keys(&self, options: &StoreOptions) -> Result<Vec<String>> {
        let opts = self.config.resolve(options);
        self.store
            .list_keys(&opts.service, opts.access_group.as_deref())
            .await
    }

    /// Whether the device can perform the authentication named by
    /// `options.authenticate_type`.
    pub fn can_check_authentication(&self, options: &StoreOptions) -> bool {
        let opts = self.config.resolve(options);
        policy::can_authenticate(opts.authenticate_type, &self.authenticator.capabilities())
    }

    /// The enrolled biometric sensor, if any.
    pub fn get_supported_biometry_type(&self) -> Option<BiometryType> {
        self.authenticator.capabilities().biometry
    }

    /// Export every entry allowed to leave the device, still encrypted.
    pub async fn export_backup(&self) -> Result<Vec<BackupRecord>> {
        self.store.export_backup().await
    }

    // -- Internal helpers ---------------------------------------------------

    /// Evaluate `entry`'s stored policy and run its challenge, if any.
    async fn authorize(
        &self,
        entry: &StoredEntry,
        opts: &ResolvedOptions,
        caps: &DeviceCapabilities,
    ) -> Result<()> {
        let stored = &entry.policy;
        let decision = policy::evaluate(
            stored.access_control,
            stored.accessible,
            opts.authenticate_type,
            caps,
            self.config.hardware_fallback,
        );
        let decision = policy::check_biometry_set(
            decision,
            stored.access_control,
            stored.biometry_set.as_deref(),
            caps,
        );

        match decision {
            Decision::Denied(reason) => Err(deny_error(reason)),
            Decision::Permitted { challenge: None } => Ok(()),
            Decision::Permitted {
                challenge: Some(kind),
            } => {
                self.gate
                    .authenticate(
                        self.authenticator.as_ref(),
                        kind,
                        &opts.authentication_prompt,
                        &entry.service,
                        &entry.key,
                    )
                    .await
            }
        }
    }
}

fn deny_error(reason: DenyReason) -> StorageError {
    match reason {
        DenyReason::NoBiometryAvailable => StorageError::NoBiometryAvailable,
        other => StorageError::AccessDenied {
            reason: other.to_string(),
        },
    }
}

/// An access group in the request hides entries from other groups.
fn ensure_access_group(entry: &StoredEntry, opts: &ResolvedOptions) -> Result<()> {
    match &opts.access_group {
        Some(group) if entry.policy.access_group.as_deref() != Some(group.as_str()) => {
            Err(StorageError::NotFound {
                service: entry.service.clone(),
                key: entry.key.clone(),
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ChallengeOutcome, ScriptedAuthenticator};
    use crate::types::{AccessControl, Accessible, AuthenticationType};

    fn device() -> DeviceCapabilities {
        DeviceCapabilities::default()
            .with_passcode(true)
            .with_secure_hardware(true)
    }

    fn storage(caps: DeviceCapabilities) -> (SecureStorage, Arc<ScriptedAuthenticator>) {
        let auth = Arc::new(ScriptedAuthenticator::new(caps));
        let storage = SecureStorage::open_in_memory(StoreConfig::default(), auth.clone()).unwrap();
        (storage, auth)
    }

    #[tokio::test]
    async fn plain_entry_roundtrip_without_challenge() {
        let (storage, auth) = storage(device());
        let opts = StoreOptions::new();

        storage.set_item("k", "value", &opts).await.unwrap();
        assert_eq!(storage.get_item("k", &opts).await.unwrap(), "value");
        assert!(auth.presented().is_empty());
    }

    #[tokio::test]
    async fn protected_entry_uses_caller_prompt() {
        let (storage, auth) = storage(device());
        let opts = StoreOptions::new()
            .with_access_control(AccessControl::DevicePasscode)
            .with_prompt("Unlock your token");

        storage.set_item("k", "secret", &opts).await.unwrap();
        assert!(auth.presented().is_empty());

        assert_eq!(storage.get_item("k", &opts).await.unwrap(), "secret");
        let presented = auth.presented();
        assert_eq!(presented.len(), 1);
        assert_eq!(presented[0].prompt, "Unlock your token");
        assert_eq!(presented[0].key, "k");
    }

    #[tokio::test]
    async fn replacing_protected_entry_requires_its_challenge() {
        let (storage, auth) = storage(device());
        let protected = StoreOptions::new().with_access_control(AccessControl::DevicePasscode);
        storage.set_item("k", "v1", &protected).await.unwrap();

        auth.push_outcome(ChallengeOutcome::Cancelled);
        let result = storage.set_item("k", "v2", &StoreOptions::new()).await;
        assert!(matches!(result, Err(StorageError::AuthChallengeCancelled)));

        assert_eq!(storage.get_item("k", &protected).await.unwrap(), "v1");
    }

    #[tokio::test]
    async fn unsatisfiable_policy_rejected_on_set() {
        let (storage, _) = storage(device());
        let opts = StoreOptions::new().with_access_control(AccessControl::BiometryAny);
        assert!(matches!(
            storage.set_item("k", "v", &opts).await,
            Err(StorageError::NoBiometryAvailable)
        ));
        assert!(
            storage
                .get_all_keys(&StoreOptions::new())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn no_secure_hardware_denies_access_control_by_default() {
        let (storage, _) = storage(DeviceCapabilities::default().with_passcode(true));
        let opts = StoreOptions::new().with_access_control(AccessControl::DevicePasscode);
        assert!(matches!(
            storage.set_item("k", "v", &opts).await,
            Err(StorageError::AccessDenied { .. })
        ));

        // Plain entries are unaffected.
        storage.set_item("k", "v", &StoreOptions::new()).await.unwrap();
    }

    #[tokio::test]
    async fn access_group_hides_foreign_entries() {
        let (storage, _) = storage(device());
        let group_a = StoreOptions::new().with_access_group("group.a");
        let group_b = StoreOptions::new().with_access_group("group.b");

        storage.set_item("k", "v", &group_a).await.unwrap();
        assert_eq!(storage.get_item("k", &group_a).await.unwrap(), "v");
        assert!(matches!(
            storage.get_item("k", &group_b).await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            storage.remove_item("k", &group_b).await,
            Err(StorageError::NotFound { .. })
        ));
        assert_eq!(storage.get_item("k", &StoreOptions::new()).await.unwrap(), "v");
    }

    #[tokio::test]
    async fn foreign_group_cannot_overwrite_entry() {
        let (storage, _) = storage(device());
        let group_a = StoreOptions::new().with_access_group("group.a");
        let group_b = StoreOptions::new().with_access_group("group.b");

        storage.set_item("k", "secret-a", &group_a).await.unwrap();
        assert!(matches!(
            storage.set_item("k", "from-b", &group_b).await,
            Err(StorageError::AccessDenied { .. })
        ));

        assert_eq!(storage.get_item("k", &group_a).await.unwrap(), "secret-a");
        assert!(matches!(
            storage.get_item("k", &group_b).await,
            Err(StorageError::NotFound { .. })
        ));

        // The owning group can still replace it.
        storage.set_item("k", "updated-a", &group_a).await.unwrap();
        assert_eq!(storage.get_item("k", &group_a).await.unwrap(), "updated-a");
    }

    #[tokio::test]
    async fn capability_queries() {
        let (storage, auth) = storage(device());
        assert_eq!(storage.get_supported_biometry_type(), None);
        assert!(storage.can_check_authentication(&StoreOptions::new()));
        assert!(!storage.can_check_authentication(
            &StoreOptions::new().with_authenticate_type(AuthenticationType::Biometrics)
        ));

        auth.set_capabilities(device().with_biometry(BiometryType::Fingerprint, "s1"));
        assert_eq!(
            storage.get_supported_biometry_type(),
            Some(BiometryType::Fingerprint)
        );
        assert!(storage.can_check_authentication(
            &StoreOptions::new().with_authenticate_type(AuthenticationType::Biometrics)
        ));
    }

    #[tokio::test]
    async fn locked_device_denies_when_unlocked_entries() {
        let (storage, auth) = storage(device());
        let opts = StoreOptions::new().with_accessible(Accessible::WhenUnlocked);
        storage.set_item("k", "v", &opts).await.unwrap();

        auth.set_capabilities(
            device().with_lock_state(crate::platform::LockState::LockedAfterFirstUnlock),
        );
        assert!(matches!(
            storage.get_item("k", &opts).await,
            Err(StorageError::AccessDenied { .. })
        ));
    }
}
