//! Portable secure credential store.
//!
//! Small secrets (tokens, passwords) are stored as string values under a
//! `(service, key)` pair.  Every value is encrypted at rest with AES-256-GCM
//! under a per-entry key derived from a root key held by a key custody
//! backend (the OS keychain or a wrapped key file).  Entries may carry an
//! access-control policy that requires the user to pass a biometric or
//! passcode challenge before the value is released.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  SecureStorage (facade, option resolution)   │
//! ├──────────────┬────────────────┬──────────────┤
//! │ policy       │ gate           │ crypto       │
//! │ (evaluate)   │ (single-flight │ (HKDF +      │
//! │              │  challenges)   │  AES-GCM)    │
//! ├──────────────┴────────────────┴──────────────┤
//! │  EntryStore (rusqlite WAL, per-entry locks)  │
//! │  KeyCustody (keychain / key file / memory)   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`storage`]: the [`SecureStorage`] facade.
//! - [`config`]: per-call options, defaults and engine configuration.
//! - [`policy`]: access policy evaluation against device capabilities.
//! - [`gate`]: the authentication gate.
//! - [`platform`]: device capabilities and the [`Authenticator`] seam.
//! - [`crypto`]: key derivation, authenticated encryption, passcode hashing.
//! - [`store`]: SQLite-backed entry persistence.
//! - [`keychain`]: root key custody backends.
//! - [`types`]: the option enums exchanged with callers.
//! - [`error`]: unified error type.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use secure_storage::platform::{DeviceCapabilities, ScriptedAuthenticator};
//! use secure_storage::{EntryStore, FileKeychain, SecureStorage, StoreConfig, StoreOptions};
//!
//! # async fn example() -> secure_storage::Result<()> {
//! let device = DeviceCapabilities::default().with_secure_hardware(true);
//! let storage = SecureStorage::new(
//!     StoreConfig::default(),
//!     EntryStore::open("data/secure.db")?,
//!     &FileKeychain::new("data/root.key"),
//!     Arc::new(ScriptedAuthenticator::new(device)),
//! )?;
//!
//! let opts = StoreOptions::new().with_service("github");
//! storage.set_item("token", "ghp_...", &opts).await?;
//! let token = storage.get_item("token", &opts).await?;
//! # let _ = token;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod gate;
pub mod keychain;
pub mod platform;
pub mod policy;
pub mod storage;
pub mod store;
pub mod types;

pub use config::{ResolvedOptions, StoreConfig, StoreOptions};
pub use error::{Result, StorageError};
pub use keychain::{FileKeychain, KeyCustody, MemoryKeychain};
pub use platform::{Authenticator, DeviceCapabilities};
pub use policy::HardwareFallback;
pub use storage::SecureStorage;
pub use store::{BackupRecord, EntryStore};
pub use types::{AccessControl, Accessible, AuthenticationType, BiometryType};
