//! Access policy engine.
//!
//! Decides whether an operation on an entry is permitted on this device and,
//! if so, which authentication challenge (if any) must succeed first.
//!
//! # Evaluation order
//!
//! 1. Accessibility against the device lock state.
//! 2. No access control: permitted without a challenge.
//! 3. Missing secure hardware, resolved by [`HardwareFallback`].
//! 4. Biometry modes: enrolled sensor, or passcode fallback for the
//!    `*OrDevicePasscode` variants.
//! 5. Passcode and user-presence modes.
//!
//! Evaluation is pure: it reads only its arguments and never performs I/O.
//! The `*ThisDeviceOnly` export restriction is enforced by the entry store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::platform::{ChallengeKind, DeviceCapabilities, LockState};
use crate::types::{AccessControl, Accessible, AuthenticationType};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What to do when an access control is requested on a device without
/// secure hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareFallback {
    /// Refuse access-controlled entries outright.
    #[default]
    Deny,
    /// Continue with software-only keys and the platform's prompts.
    SoftwareOnly,
}

/// Why a policy evaluation denied the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NoBiometryAvailable,
    PasscodeNotSet,
    NoAuthenticationAvailable,
    NoSecureHardware,
    DeviceLocked,
    BiometrySetChanged,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoBiometryAvailable => "no biometry available",
            Self::PasscodeNotSet => "device passcode is not set",
            Self::NoAuthenticationAvailable => "no authentication method available",
            Self::NoSecureHardware => "no secure hardware available",
            Self::DeviceLocked => "entry is not accessible while the device is locked",
            Self::BiometrySetChanged => "enrolled biometry changed since the entry was stored",
        };
        f.write_str(s)
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Allowed, after `challenge` succeeds if one is required.
    Permitted { challenge: Option<ChallengeKind> },
    Denied(DenyReason),
}

impl Decision {
    fn challenge(kind: ChallengeKind) -> Self {
        Self::Permitted {
            challenge: Some(kind),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate `access_control` and `accessible` against device `caps`.
pub fn evaluate(
    access_control: Option<AccessControl>,
    accessible: Accessible,
    authenticate_type: AuthenticationType,
    caps: &DeviceCapabilities,
    fallback: HardwareFallback,
) -> Decision {
    if let Some(reason) = check_accessible(accessible, caps) {
        tracing::debug!(%accessible, %reason, "accessibility check denied");
        return Decision::Denied(reason);
    }

    let Some(access_control) = access_control else {
        return Decision::Permitted { challenge: None };
    };

    if !caps.secure_hardware {
        match fallback {
            HardwareFallback::Deny => {
                tracing::debug!(%access_control, "no secure hardware, denying");
                return Decision::Denied(DenyReason::NoSecureHardware);
            }
            HardwareFallback::SoftwareOnly => {
                tracing::warn!(%access_control, "no secure hardware, using software-only keys");
            }
        }
    }

    let decision = match access_control {
        ac if ac.requires_biometry() => {
            if caps.has_biometry() {
                if ac.allows_passcode_fallback() && caps.passcode_set {
                    Decision::challenge(ChallengeKind::BiometryOrPasscode)
                } else {
                    Decision::challenge(ChallengeKind::Biometry)
                }
            } else if ac.allows_passcode_fallback() && caps.passcode_set {
                Decision::challenge(ChallengeKind::DevicePasscode)
            } else {
                Decision::Denied(DenyReason::NoBiometryAvailable)
            }
        }
        AccessControl::DevicePasscode => {
            if caps.passcode_set {
                Decision::challenge(ChallengeKind::DevicePasscode)
            } else {
                Decision::Denied(DenyReason::PasscodeNotSet)
            }
        }
        AccessControl::UserPresence => user_presence(authenticate_type, caps),
        AccessControl::ApplicationPassword => {
            Decision::challenge(ChallengeKind::ApplicationPassword)
        }
        // Every biometry mode is covered by the guard above.
        _ => Decision::Denied(DenyReason::NoAuthenticationAvailable),
    };

    tracing::debug!(%access_control, %accessible, ?decision, "policy evaluated");
    decision
}

fn user_presence(authenticate_type: AuthenticationType, caps: &DeviceCapabilities) -> Decision {
    match (authenticate_type, caps.has_biometry(), caps.passcode_set) {
        (AuthenticationType::Biometrics, true, _) => Decision::challenge(ChallengeKind::Biometry),
        (AuthenticationType::Biometrics, false, _) => {
            Decision::Denied(DenyReason::NoBiometryAvailable)
        }
        (AuthenticationType::DevicePasscodeOrBiometrics, true, true) => {
            Decision::challenge(ChallengeKind::BiometryOrPasscode)
        }
        (AuthenticationType::DevicePasscodeOrBiometrics, true, false) => {
            Decision::challenge(ChallengeKind::Biometry)
        }
        (AuthenticationType::DevicePasscodeOrBiometrics, false, true) => {
            Decision::challenge(ChallengeKind::DevicePasscode)
        }
        (AuthenticationType::DevicePasscodeOrBiometrics, false, false) => {
            Decision::Denied(DenyReason::NoAuthenticationAvailable)
        }
    }
}

fn check_accessible(accessible: Accessible, caps: &DeviceCapabilities) -> Option<DenyReason> {
    let lock_ok = match accessible {
        Accessible::WhenUnlocked
        | Accessible::WhenUnlockedThisDeviceOnly
        | Accessible::WhenPasscodeSetThisDeviceOnly => caps.lock_state == LockState::Unlocked,
        Accessible::AfterFirstUnlock | Accessible::AfterFirstUnlockThisDeviceOnly => {
            caps.lock_state != LockState::LockedBeforeFirstUnlock
        }
        Accessible::Always | Accessible::AlwaysThisDeviceOnly => true,
    };

    if !lock_ok {
        return Some(DenyReason::DeviceLocked);
    }
    if accessible == Accessible::WhenPasscodeSetThisDeviceOnly && !caps.passcode_set {
        return Some(DenyReason::PasscodeNotSet);
    }
    None
}

/// Re-check a permitted decision for an entry bound to the biometry set
/// enrolled when it was stored.
///
/// If the set changed, biometry is no longer acceptable.  The
/// `*OrDevicePasscode` variant falls back to the passcode; otherwise the
/// entry is unreadable.
pub fn check_biometry_set(
    decision: Decision,
    access_control: Option<AccessControl>,
    stored_set: Option<&str>,
    caps: &DeviceCapabilities,
) -> Decision {
    let Some(ac) = access_control.filter(AccessControl::binds_biometry_set) else {
        return decision;
    };
    let Decision::Permitted {
        challenge: Some(kind),
    } = decision
    else {
        return decision;
    };
    if kind == ChallengeKind::DevicePasscode || stored_set == caps.biometry_set.as_deref() {
        return decision;
    }

    tracing::debug!(access_control = %ac, "biometry set changed since entry was stored");
    if ac.allows_passcode_fallback() && caps.passcode_set {
        Decision::challenge(ChallengeKind::DevicePasscode)
    } else {
        Decision::Denied(DenyReason::BiometrySetChanged)
    }
}

/// Whether the device can run a challenge of `authenticate_type` at all.
pub fn can_authenticate(authenticate_type: AuthenticationType, caps: &DeviceCapabilities) -> bool {
    match authenticate_type {
        AuthenticationType::Biometrics => caps.has_biometry(),
        AuthenticationType::DevicePasscodeOrBiometrics => caps.has_biometry() || caps.passcode_set,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BiometryType;

    fn secure() -> DeviceCapabilities {
        DeviceCapabilities::default().with_secure_hardware(true)
    }

    fn eval(ac: Option<AccessControl>, caps: &DeviceCapabilities) -> Decision {
        evaluate(
            ac,
            Accessible::WhenUnlocked,
            AuthenticationType::DevicePasscodeOrBiometrics,
            caps,
            HardwareFallback::Deny,
        )
    }

    #[test]
    fn no_access_control_needs_no_challenge() {
        // Even without secure hardware or any authenticator.
        let caps = DeviceCapabilities::default();
        for accessible in [Accessible::Always, Accessible::AfterFirstUnlock] {
            let d = evaluate(
                None,
                accessible,
                AuthenticationType::Biometrics,
                &caps,
                HardwareFallback::Deny,
            );
            assert_eq!(d, Decision::Permitted { challenge: None });
        }
    }

    #[test]
    fn biometry_without_sensor_is_denied() {
        let caps = secure().with_passcode(true);
        assert_eq!(
            eval(Some(AccessControl::BiometryAny), &caps),
            Decision::Denied(DenyReason::NoBiometryAvailable)
        );
        assert_eq!(
            eval(Some(AccessControl::BiometryCurrentSet), &caps),
            Decision::Denied(DenyReason::NoBiometryAvailable)
        );
    }

    #[test]
    fn or_passcode_variants_fall_back_to_passcode() {
        let caps = secure().with_passcode(true);
        assert_eq!(
            eval(Some(AccessControl::BiometryAnyOrDevicePasscode), &caps),
            Decision::challenge(ChallengeKind::DevicePasscode)
        );

        let no_passcode = secure();
        assert_eq!(
            eval(
                Some(AccessControl::BiometryCurrentSetOrDevicePasscode),
                &no_passcode
            ),
            Decision::Denied(DenyReason::NoBiometryAvailable)
        );
    }

    #[test]
    fn biometry_with_sensor_challenges() {
        let caps = secure()
            .with_biometry(BiometryType::TouchId, "a")
            .with_passcode(true);
        assert_eq!(
            eval(Some(AccessControl::BiometryAny), &caps),
            Decision::challenge(ChallengeKind::Biometry)
        );
        assert_eq!(
            eval(Some(AccessControl::BiometryAnyOrDevicePasscode), &caps),
            Decision::challenge(ChallengeKind::BiometryOrPasscode)
        );
    }

    #[test]
    fn device_passcode_requires_passcode() {
        assert_eq!(
            eval(Some(AccessControl::DevicePasscode), &secure()),
            Decision::Denied(DenyReason::PasscodeNotSet)
        );
        assert_eq!(
            eval(
                Some(AccessControl::DevicePasscode),
                &secure().with_passcode(true)
            ),
            Decision::challenge(ChallengeKind::DevicePasscode)
        );
    }

    #[test]
    fn user_presence_respects_authenticate_type() {
        let caps = secure().with_passcode(true);
        assert_eq!(
            eval(Some(AccessControl::UserPresence), &caps),
            Decision::challenge(ChallengeKind::DevicePasscode)
        );
        let biometrics_only = evaluate(
            Some(AccessControl::UserPresence),
            Accessible::WhenUnlocked,
            AuthenticationType::Biometrics,
            &caps,
            HardwareFallback::Deny,
        );
        assert_eq!(
            biometrics_only,
            Decision::Denied(DenyReason::NoBiometryAvailable)
        );
        assert_eq!(
            eval(Some(AccessControl::UserPresence), &secure()),
            Decision::Denied(DenyReason::NoAuthenticationAvailable)
        );
    }

    #[test]
    fn application_password_always_challenges() {
        assert_eq!(
            eval(Some(AccessControl::ApplicationPassword), &secure()),
            Decision::challenge(ChallengeKind::ApplicationPassword)
        );
    }

    #[test]
    fn missing_hardware_follows_fallback() {
        let caps = DeviceCapabilities::default().with_passcode(true);
        assert_eq!(
            eval(Some(AccessControl::DevicePasscode), &caps),
            Decision::Denied(DenyReason::NoSecureHardware)
        );
        let d = evaluate(
            Some(AccessControl::DevicePasscode),
            Accessible::WhenUnlocked,
            AuthenticationType::DevicePasscodeOrBiometrics,
            &caps,
            HardwareFallback::SoftwareOnly,
        );
        assert_eq!(d, Decision::challenge(ChallengeKind::DevicePasscode));
    }

    #[test]
    fn lock_state_gates_accessibility() {
        let after_first = secure().with_lock_state(LockState::LockedAfterFirstUnlock);
        let before_first = secure().with_lock_state(LockState::LockedBeforeFirstUnlock);
        let run = |accessible, caps: &DeviceCapabilities| {
            evaluate(
                None,
                accessible,
                AuthenticationType::DevicePasscodeOrBiometrics,
                caps,
                HardwareFallback::Deny,
            )
        };

        assert_eq!(
            run(Accessible::WhenUnlocked, &after_first),
            Decision::Denied(DenyReason::DeviceLocked)
        );
        assert_eq!(
            run(Accessible::AfterFirstUnlock, &after_first),
            Decision::Permitted { challenge: None }
        );
        assert_eq!(
            run(Accessible::AfterFirstUnlockThisDeviceOnly, &before_first),
            Decision::Denied(DenyReason::DeviceLocked)
        );
        assert_eq!(
            run(Accessible::AlwaysThisDeviceOnly, &before_first),
            Decision::Permitted { challenge: None }
        );
    }

    #[test]
    fn passcode_set_accessibility_requires_passcode() {
        let d = evaluate(
            None,
            Accessible::WhenPasscodeSetThisDeviceOnly,
            AuthenticationType::DevicePasscodeOrBiometrics,
            &secure(),
            HardwareFallback::Deny,
        );
        assert_eq!(d, Decision::Denied(DenyReason::PasscodeNotSet));
    }

    #[test]
    fn changed_biometry_set_invalidates_current_set_entries() {
        let caps = secure()
            .with_biometry(BiometryType::FaceId, "set-2")
            .with_passcode(true);

        let strict = Some(AccessControl::BiometryCurrentSet);
        let d = check_biometry_set(eval(strict, &caps), strict, Some("set-1"), &caps);
        assert_eq!(d, Decision::Denied(DenyReason::BiometrySetChanged));

        let lenient = Some(AccessControl::BiometryCurrentSetOrDevicePasscode);
        let d = check_biometry_set(eval(lenient, &caps), lenient, Some("set-1"), &caps);
        assert_eq!(d, Decision::challenge(ChallengeKind::DevicePasscode));

        let unchanged = check_biometry_set(eval(strict, &caps), strict, Some("set-2"), &caps);
        assert_eq!(unchanged, Decision::challenge(ChallengeKind::Biometry));

        let any = Some(AccessControl::BiometryAny);
        let d = check_biometry_set(eval(any, &caps), any, Some("set-1"), &caps);
        assert_eq!(d, Decision::challenge(ChallengeKind::Biometry));
    }

    #[test]
    fn can_authenticate_by_type() {
        let passcode_only = secure().with_passcode(true);
        assert!(can_authenticate(
            AuthenticationType::DevicePasscodeOrBiometrics,
            &passcode_only
        ));
        assert!(!can_authenticate(
            AuthenticationType::Biometrics,
            &passcode_only
        ));
        let nothing = DeviceCapabilities::default();
        assert!(!can_authenticate(
            AuthenticationType::DevicePasscodeOrBiometrics,
            &nothing
        ));
    }
}
