//! Authentication gate: one user-presence challenge at a time.
//!
//! ```text
//! Idle ──authenticate──▶ Challenging ──▶ Succeeded | Failed | Cancelled
//!  ▲                                          │
//!  └──────────── reset before return ─────────┘
//! ```
//!
//! A device can show only one biometric or passcode prompt, so the gate is
//! exclusive across the whole store.  A request that arrives while another
//! challenge is in flight fails immediately with
//! [`StorageError::ConcurrentChallenge`]; it is never queued.  Outcomes are
//! reported as-is: a failed or cancelled challenge is not retried.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::platform::{
    AuthenticationChallenge, Authenticator, ChallengeKind, ChallengeOutcome, FailureReason,
};

/// Observable state of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Challenging { id: Uuid, kind: ChallengeKind },
}

/// Single-flight coordinator for authentication challenges.
pub struct AuthenticationGate {
    state: Mutex<GateState>,
    timeout: Duration,
}

/// Resets the gate to `Idle` when dropped, including when the caller drops
/// the pending future.
struct InFlight<'a> {
    gate: &'a AuthenticationGate,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *self
            .gate
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = GateState::Idle;
    }
}

impl AuthenticationGate {
    /// Create a gate whose challenges fail with a timeout after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
            timeout,
        }
    }

    pub fn state(&self) -> GateState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Present a `kind` challenge for entry `(service, key)` and wait for
    /// the user.
    ///
    /// # Errors
    ///
    /// - [`StorageError::EmptyPrompt`] if `prompt` is blank.
    /// - [`StorageError::ConcurrentChallenge`] if a challenge is in flight.
    /// - [`StorageError::AuthChallengeFailed`],
    ///   [`StorageError::AuthChallengeCancelled`] or
    ///   [`StorageError::AuthChallengeTimeout`] for the matching outcome.
    pub async fn authenticate(
        &self,
        authenticator: &dyn Authenticator,
        kind: ChallengeKind,
        prompt: &str,
        service: &str,
        key: &str,
    ) -> Result<()> {
        if prompt.trim().is_empty() {
            return Err(StorageError::EmptyPrompt);
        }

        let challenge = AuthenticationChallenge {
            id: Uuid::now_v7(),
            prompt: prompt.to_string(),
            kind,
            service: service.to_string(),
            key: key.to_string(),
        };

        let in_flight = self.begin(&challenge)?;

        let outcome = tokio::time::timeout(self.timeout, authenticator.present_challenge(&challenge))
            .await
            .unwrap_or(ChallengeOutcome::Failure(FailureReason::Timeout));

        drop(in_flight);

        tracing::debug!(challenge_id = %challenge.id, ?outcome, "challenge finished");

        match outcome {
            ChallengeOutcome::Success => Ok(()),
            ChallengeOutcome::Cancelled => Err(StorageError::AuthChallengeCancelled),
            ChallengeOutcome::Failure(FailureReason::Timeout) => {
                Err(StorageError::AuthChallengeTimeout {
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            ChallengeOutcome::Failure(reason) => Err(StorageError::AuthChallengeFailed {
                reason: reason.to_string(),
            }),
        }
    }

    fn begin(&self, challenge: &AuthenticationChallenge) -> Result<InFlight<'_>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let GateState::Challenging { id, .. } = *state {
            tracing::debug!(active = %id, "rejecting concurrent challenge");
            return Err(StorageError::ConcurrentChallenge);
        }

        *state = GateState::Challenging {
            id: challenge.id,
            kind: challenge.kind,
        };
        tracing::debug!(
            challenge_id = %challenge.id,
            kind = ?challenge.kind,
            service = %challenge.service,
            "presenting authentication challenge"
        );

        Ok(InFlight { gate: self })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::platform::{DeviceCapabilities, ScriptedAuthenticator};

    fn scripted() -> Arc<ScriptedAuthenticator> {
        Arc::new(ScriptedAuthenticator::new(
            DeviceCapabilities::default().with_passcode(true),
        ))
    }

    async fn run(gate: &AuthenticationGate, auth: &ScriptedAuthenticator) -> Result<()> {
        gate.authenticate(auth, ChallengeKind::DevicePasscode, "unlock", "default", "k")
            .await
    }

    #[tokio::test]
    async fn success_returns_to_idle() {
        let gate = AuthenticationGate::new(Duration::from_secs(5));
        let auth = scripted();
        run(&gate, &auth).await.unwrap();
        assert_eq!(gate.state(), GateState::Idle);
    }

    #[tokio::test]
    async fn outcomes_map_to_distinct_errors() {
        let gate = AuthenticationGate::new(Duration::from_secs(5));
        let auth = scripted();
        auth.push_outcome(ChallengeOutcome::Cancelled);
        auth.push_outcome(ChallengeOutcome::Failure(FailureReason::NotRecognized));

        assert!(matches!(
            run(&gate, &auth).await,
            Err(StorageError::AuthChallengeCancelled)
        ));
        assert!(matches!(
            run(&gate, &auth).await,
            Err(StorageError::AuthChallengeFailed { .. })
        ));
        assert_eq!(gate.state(), GateState::Idle);
        assert_eq!(auth.presented().len(), 2);
    }

    #[tokio::test]
    async fn empty_prompt_rejected_before_challenging() {
        let gate = AuthenticationGate::new(Duration::from_secs(5));
        let auth = scripted();
        let result = gate
            .authenticate(&*auth, ChallengeKind::Biometry, "   ", "default", "k")
            .await;
        assert!(matches!(result, Err(StorageError::EmptyPrompt)));
        assert!(auth.presented().is_empty());
    }

    #[tokio::test]
    async fn second_challenge_fails_fast_while_first_in_flight() {
        let gate = Arc::new(AuthenticationGate::new(Duration::from_secs(5)));
        let auth = scripted();
        auth.push_delayed_outcome(ChallengeOutcome::Success, Duration::from_millis(300));

        let first = {
            let gate = Arc::clone(&gate);
            let auth = Arc::clone(&auth);
            tokio::spawn(async move { run(&gate, &auth).await })
        };

        while gate.state() == GateState::Idle {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = std::time::Instant::now();
        let second = run(&gate, &auth).await;
        assert!(matches!(second, Err(StorageError::ConcurrentChallenge)));
        assert!(started.elapsed() < Duration::from_millis(200));

        first.await.unwrap().unwrap();
        assert_eq!(gate.state(), GateState::Idle);
    }

    #[tokio::test]
    async fn slow_prompt_times_out() {
        let gate = AuthenticationGate::new(Duration::from_millis(50));
        let auth = scripted();
        auth.push_delayed_outcome(ChallengeOutcome::Success, Duration::from_secs(10));

        let result = run(&gate, &auth).await;
        assert!(matches!(
            result,
            Err(StorageError::AuthChallengeTimeout { timeout_ms: 50 })
        ));
        assert_eq!(gate.state(), GateState::Idle);
    }

    #[tokio::test]
    async fn dropping_pending_challenge_resets_gate() {
        let gate = AuthenticationGate::new(Duration::from_secs(5));
        let auth = scripted();
        auth.push_delayed_outcome(ChallengeOutcome::Success, Duration::from_secs(10));

        let abandoned = tokio::time::timeout(Duration::from_millis(30), run(&gate, &auth)).await;
        assert!(abandoned.is_err());
        assert_eq!(gate.state(), GateState::Idle);

        // The next challenge is served normally.
        run(&gate, &auth).await.unwrap();
    }
}
