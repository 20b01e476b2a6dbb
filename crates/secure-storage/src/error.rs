//! Secure storage error types.
//!
//! Every subsystem surfaces failures through [`StorageError`], the single
//! error type returned by the public API.  Policy, authentication and crypto
//! failures each have their own variant so callers never have to inspect
//! opaque strings or collapse a denial into a boolean.

/// Unified error type for the secure storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    // -- Entry errors -------------------------------------------------------
    /// No entry exists for the requested `(service, key)` pair.
    #[error("entry not found: service={service}, key={key}")]
    NotFound { service: String, key: String },

    // -- Crypto errors ------------------------------------------------------
    /// Decryption failed: wrong key, tampered or truncated ciphertext.
    #[error("decryption failed: {reason}")]
    Decrypt { reason: String },

    /// Encryption failed (invalid key length, CSPRNG failure, ...).
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// Key derivation failed.
    #[error("key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    // -- Policy errors ------------------------------------------------------
    /// The access policy does not permit the operation on this device.
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    /// The access control requires biometry but no sensor is enrolled.
    #[error("no biometry available on this device")]
    NoBiometryAvailable,

    // -- Authentication errors ---------------------------------------------
    /// Another authentication challenge is already being presented.
    #[error("an authentication challenge is already in progress")]
    ConcurrentChallenge,

    /// The user failed the authentication challenge.
    #[error("authentication failed: {reason}")]
    AuthChallengeFailed { reason: String },

    /// The user cancelled the authentication challenge.
    #[error("authentication cancelled by user")]
    AuthChallengeCancelled,

    /// The authentication challenge did not complete in time.
    #[error("authentication timed out after {timeout_ms}ms")]
    AuthChallengeTimeout { timeout_ms: u64 },

    /// A challenge was requested with an empty prompt message.
    #[error("authentication prompt must not be empty")]
    EmptyPrompt,

    // -- Root key custody ---------------------------------------------------
    /// No root key has been stored with the key custody backend.
    #[error("root key not found")]
    RootKeyNotFound,

    /// The key custody backend failed or is unavailable.
    #[error("key custody failed: {reason}")]
    KeyCustody { reason: String },

    // -- Input errors -------------------------------------------------------
    /// An option value could not be parsed.
    #[error("invalid {field}: {value:?}")]
    InvalidOption { field: &'static str, value: String },

    // -- Underlying errors --------------------------------------------------
    /// The durable store failed; no partial write was applied.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Filesystem error (root key file, backup export, ...).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking task panicked or a lock was poisoned.
    #[error("task failed: {0}")]
    TaskJoin(String),

    /// Catch-all for unexpected internal errors.  Prefer a typed variant.
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::TaskJoin(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageError>;
