//! Store configuration and per-call options.
//!
//! [`StoreConfig`] holds the process-wide defaults that every call's
//! [`StoreOptions`] are merged over.  The merge is shallow: each field the
//! caller supplies replaces the default, every other field keeps it.
//!
//! Defaults:
//!
//! | field                   | default                                  |
//! |-------------------------|------------------------------------------|
//! | `access_control`        | none                                     |
//! | `accessible`            | `AccessibleWhenUnlocked`                 |
//! | `access_group`          | none                                     |
//! | `authentication_prompt` | `"Authenticate to retrieve secret data"` |
//! | `service`               | `"default"`                              |
//! | `authenticate_type`     | `DevicePasscodeOrBiometrics`             |
//! | `challenge_timeout`     | 60 s                                     |
//! | `hardware_fallback`     | `Deny`                                   |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::HardwareFallback;
use crate::types::{AccessControl, Accessible, AuthenticationType};

/// Default authentication prompt.
pub const DEFAULT_PROMPT: &str = "Authenticate to retrieve secret data";

/// Service used when a call does not name one.
pub const DEFAULT_SERVICE: &str = "default";

/// Default bound on a single authentication challenge, in milliseconds.
pub const DEFAULT_CHALLENGE_TIMEOUT_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// StoreOptions
// ---------------------------------------------------------------------------

/// Caller-supplied options for one operation.  Unset fields fall back to
/// [`StoreConfig::defaults`].
///
/// Deserializes from the camelCase shape a JavaScript caller sends, e.g.
/// `{"accessControl": "DevicePasscode", "service": "example"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreOptions {
    pub access_control: Option<AccessControl>,
    pub accessible: Option<Accessible>,
    pub access_group: Option<String>,
    pub authentication_prompt: Option<String>,
    pub service: Option<String>,
    pub authenticate_type: Option<AuthenticationType>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_access_control(mut self, access_control: AccessControl) -> Self {
        self.access_control = Some(access_control);
        self
    }

    pub fn with_accessible(mut self, accessible: Accessible) -> Self {
        self.accessible = Some(accessible);
        self
    }

    pub fn with_access_group(mut self, group: impl Into<String>) -> Self {
        self.access_group = Some(group.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.authentication_prompt = Some(prompt.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_authenticate_type(mut self, authenticate_type: AuthenticationType) -> Self {
        self.authenticate_type = Some(authenticate_type);
        self
    }

    /// Shallow-merge these options over `defaults`.
    pub fn resolve(&self, defaults: &ResolvedOptions) -> ResolvedOptions {
        ResolvedOptions {
            access_control: self.access_control.or(defaults.access_control),
            accessible: self.accessible.unwrap_or(defaults.accessible),
            access_group: self
                .access_group
                .clone()
                .or_else(|| defaults.access_group.clone()),
            authentication_prompt: self
                .authentication_prompt
                .clone()
                .unwrap_or_else(|| defaults.authentication_prompt.clone()),
            service: self
                .service
                .clone()
                .unwrap_or_else(|| defaults.service.clone()),
            authenticate_type: self.authenticate_type.unwrap_or(defaults.authenticate_type),
        }
    }
}

// ---------------------------------------------------------------------------
// ResolvedOptions
// ---------------------------------------------------------------------------

/// Fully resolved options: every field has a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolvedOptions {
    pub access_control: Option<AccessControl>,
    pub accessible: Accessible,
    pub access_group: Option<String>,
    pub authentication_prompt: String,
    pub service: String,
    pub authenticate_type: AuthenticationType,
}

impl Default for ResolvedOptions {
    fn default() -> Self {
        Self {
            access_control: None,
            accessible: Accessible::WhenUnlocked,
            access_group: None,
            authentication_prompt: DEFAULT_PROMPT.to_string(),
            service: DEFAULT_SERVICE.to_string(),
            authenticate_type: AuthenticationType::DevicePasscodeOrBiometrics,
        }
    }
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Defaults merged under every call's [`StoreOptions`].
    pub defaults: ResolvedOptions,

    /// Upper bound on one authentication challenge, in milliseconds.
    pub challenge_timeout_ms: u64,

    /// Behaviour for access-controlled entries on devices without secure
    /// hardware.
    pub hardware_fallback: HardwareFallback,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            defaults: ResolvedOptions::default(),
            challenge_timeout_ms: DEFAULT_CHALLENGE_TIMEOUT_MS,
            hardware_fallback: HardwareFallback::Deny,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_service(mut self, service: impl Into<String>) -> Self {
        self.defaults.service = service.into();
        self
    }

    pub fn with_defaults(mut self, defaults: ResolvedOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_challenge_timeout(mut self, timeout: Duration) -> Self {
        self.challenge_timeout_ms = u64::try_from(timeout.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        self
    }

    pub fn with_hardware_fallback(mut self, fallback: HardwareFallback) -> Self {
        self.hardware_fallback = fallback;
        self
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_millis(self.challenge_timeout_ms)
    }

    /// Resolve a call's options against this configuration.
    pub fn resolve(&self, options: &StoreOptions) -> ResolvedOptions {
        options.resolve(&self.defaults)
    }
}
