//! Platform capability interface.
//!
//! The core never talks to secure hardware directly.  A platform adapter
//! (iOS LocalAuthentication, Android BiometricPrompt, a terminal prompt, a
//! test script) implements [`Authenticator`] to report what the device can do
//! and to present user-presence challenges.  Root key custody lives in
//! [`crate::keychain`].
//!
//! [`ScriptedAuthenticator`] is an in-process adapter that answers challenges
//! from a queue of scripted outcomes.  It backs simulations and the test
//! suite.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::BiometryType;

// ---------------------------------------------------------------------------
// Device capabilities
// ---------------------------------------------------------------------------

/// Device lock state, as far as entry accessibility is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    #[default]
    Unlocked,
    /// Locked, but unlocked at least once since boot.
    LockedAfterFirstUnlock,
    /// Locked and never unlocked since boot.
    LockedBeforeFirstUnlock,
}

/// What the device's security subsystem currently offers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Enrolled biometric sensor, if any.
    pub biometry: Option<BiometryType>,

    /// Opaque fingerprint of the enrolled biometry set.  Changes whenever a
    /// finger or face is added or removed.
    pub biometry_set: Option<String>,

    /// Whether a device passcode is configured.
    pub passcode_set: bool,

    /// Whether keys are held by secure hardware (enclave, TEE, StrongBox).
    pub secure_hardware: bool,

    pub lock_state: LockState,
}

impl DeviceCapabilities {
    /// Whether an enrolled biometric sensor is available.
    pub fn has_biometry(&self) -> bool {
        self.biometry.is_some()
    }

    pub fn with_biometry(mut self, biometry: BiometryType, set: impl Into<String>) -> Self {
        self.biometry = Some(biometry);
        self.biometry_set = Some(set.into());
        self
    }

    pub fn with_passcode(mut self, set: bool) -> Self {
        self.passcode_set = set;
        self
    }

    pub fn with_secure_hardware(mut self, available: bool) -> Self {
        self.secure_hardware = available;
        self
    }

    pub fn with_lock_state(mut self, state: LockState) -> Self {
        self.lock_state = state;
        self
    }
}

// ---------------------------------------------------------------------------
// Challenges
// ---------------------------------------------------------------------------

/// Which authenticator a challenge asks the user for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Biometry,
    DevicePasscode,
    BiometryOrPasscode,
    ApplicationPassword,
}

/// A single in-flight user-presence prompt.
#[derive(Debug, Clone)]
pub struct AuthenticationChallenge {
    pub id: Uuid,
    pub prompt: String,
    pub kind: ChallengeKind,
    pub service: String,
    pub key: String,
}

/// Why a challenge failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The presented biometry or passcode did not match.
    NotRecognized,
    /// Too many failed attempts; the platform locked the authenticator.
    LockedOut,
    /// The prompt did not complete within the configured bound.
    Timeout,
    /// Any other platform-reported failure.
    Platform(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRecognized => f.write_str("credential not recognized"),
            Self::LockedOut => f.write_str("authenticator locked out"),
            Self::Timeout => f.write_str("timed out"),
            Self::Platform(reason) => write!(f, "platform error: {reason}"),
        }
    }
}

/// Result reported by the platform for one challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Success,
    Failure(FailureReason),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Platform adapter for capability queries and authentication prompts.
///
/// `present_challenge` must be cancel-safe: dropping the returned future
/// dismisses the prompt.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Current device capabilities.  Must not block.
    fn capabilities(&self) -> DeviceCapabilities;

    /// Present `challenge` to the user and wait for the result.
    async fn present_challenge(&self, challenge: &AuthenticationChallenge) -> ChallengeOutcome;
}

// ---------------------------------------------------------------------------
// Scripted adapter
// ---------------------------------------------------------------------------

struct ScriptedResponse {
    outcome: ChallengeOutcome,
    delay: Option<Duration>,
}

/// Answers challenges from a queue of scripted outcomes.
///
/// When the queue is empty every challenge succeeds.  Capabilities can be
/// changed at any time to simulate enrollment changes or lock transitions.
pub struct ScriptedAuthenticator {
    capabilities: Mutex<DeviceCapabilities>,
    responses: Mutex<VecDeque<ScriptedResponse>>,
    presented: Mutex<Vec<AuthenticationChallenge>>,
}

impl ScriptedAuthenticator {
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities: Mutex::new(capabilities),
            responses: Mutex::new(VecDeque::new()),
            presented: Mutex::new(Vec::new()),
        }
    }

    /// Queue the outcome for the next unanswered challenge.
    pub fn push_outcome(&self, outcome: ChallengeOutcome) {
        self.push_response(outcome, None);
    }

    /// Queue an outcome that is only reported after `delay`.
    pub fn push_delayed_outcome(&self, outcome: ChallengeOutcome, delay: Duration) {
        self.push_response(outcome, Some(delay));
    }

    /// Replace the reported device capabilities.
    pub fn set_capabilities(&self, capabilities: DeviceCapabilities) {
        if let Ok(mut caps) = self.capabilities.lock() {
            *caps = capabilities;
        }
    }

    /// Every challenge presented so far, oldest first.
    pub fn presented(&self) -> Vec<AuthenticationChallenge> {
        self.presented
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn push_response(&self, outcome: ChallengeOutcome, delay: Option<Duration>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(ScriptedResponse { outcome, delay });
        }
    }
}

#[async_trait]
impl Authenticator for ScriptedAuthenticator {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    async fn present_challenge(&self, challenge: &AuthenticationChallenge) -> ChallengeOutcome {
        if let Ok(mut presented) = self.presented.lock() {
            presented.push(challenge.clone());
        }

        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());

        let Some(response) = next else {
            return ChallengeOutcome::Success;
        };

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }

        tracing::debug!(
            challenge_id = %challenge.id,
            outcome = ?response.outcome,
            "scripted challenge answered"
        );
        response.outcome
    }
}
