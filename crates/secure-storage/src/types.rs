//! Access-control, accessibility and biometry enums.
//!
//! Each enum has a canonical string form (e.g. `AccessibleWhenUnlocked`,
//! `BiometryAnyOrDevicePasscode`) shared by serde, [`std::str::FromStr`],
//! [`std::fmt::Display`] and the SQLite columns, so options coming from a
//! JavaScript or JSON caller map onto the types one to one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Generates `as_str`, `Display` and `FromStr` from a single variant table.
macro_rules! string_enum {
    ($ty:ident, $field:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            /// All variants, in declaration order.
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            /// Canonical string form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = StorageError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    _ => Err(StorageError::InvalidOption {
                        field: $field,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// AccessControl
// ---------------------------------------------------------------------------

/// Authentication required before an entry may be read or replaced.
///
/// "No access control" is expressed as `Option::<AccessControl>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessControl {
    /// Biometry if available, otherwise the device passcode.
    UserPresence,
    /// Any enrolled biometry; survives enrollment changes.
    BiometryAny,
    /// Only the biometry set enrolled when the entry was written.
    BiometryCurrentSet,
    /// Device passcode only.
    DevicePasscode,
    /// An application-supplied password.
    ApplicationPassword,
    BiometryAnyOrDevicePasscode,
    BiometryCurrentSetOrDevicePasscode,
}

string_enum!(AccessControl, "access_control", {
    UserPresence => "UserPresence",
    BiometryAny => "BiometryAny",
    BiometryCurrentSet => "BiometryCurrentSet",
    DevicePasscode => "DevicePasscode",
    ApplicationPassword => "ApplicationPassword",
    BiometryAnyOrDevicePasscode => "BiometryAnyOrDevicePasscode",
    BiometryCurrentSetOrDevicePasscode => "BiometryCurrentSetOrDevicePasscode",
});

impl AccessControl {
    /// Whether this mode needs an enrolled biometric sensor.
    pub fn requires_biometry(&self) -> bool {
        matches!(
            self,
            Self::BiometryAny
                | Self::BiometryCurrentSet
                | Self::BiometryAnyOrDevicePasscode
                | Self::BiometryCurrentSetOrDevicePasscode
        )
    }

    /// Whether the device passcode may stand in for missing biometry.
    pub fn allows_passcode_fallback(&self) -> bool {
        matches!(
            self,
            Self::BiometryAnyOrDevicePasscode | Self::BiometryCurrentSetOrDevicePasscode
        )
    }

    /// Whether the entry is bound to the biometry set enrolled at write time.
    pub fn binds_biometry_set(&self) -> bool {
        matches!(
            self,
            Self::BiometryCurrentSet | Self::BiometryCurrentSetOrDevicePasscode
        )
    }
}

// ---------------------------------------------------------------------------
// Accessible
// ---------------------------------------------------------------------------

/// When an entry is readable relative to the device lock state, and whether
/// it may leave the device in a backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Accessible {
    #[default]
    #[serde(rename = "AccessibleWhenUnlocked")]
    WhenUnlocked,
    #[serde(rename = "AccessibleAfterFirstUnlock")]
    AfterFirstUnlock,
    #[serde(rename = "AccessibleAlways")]
    Always,
    #[serde(rename = "AccessibleWhenPasscodeSetThisDeviceOnly")]
    WhenPasscodeSetThisDeviceOnly,
    #[serde(rename = "AccessibleWhenUnlockedThisDeviceOnly")]
    WhenUnlockedThisDeviceOnly,
    #[serde(rename = "AccessibleAfterFirstUnlockThisDeviceOnly")]
    AfterFirstUnlockThisDeviceOnly,
    #[serde(rename = "AccessibleAlwaysThisDeviceOnly")]
    AlwaysThisDeviceOnly,
}

string_enum!(Accessible, "accessible", {
    WhenUnlocked => "AccessibleWhenUnlocked",
    AfterFirstUnlock => "AccessibleAfterFirstUnlock",
    Always => "AccessibleAlways",
    WhenPasscodeSetThisDeviceOnly => "AccessibleWhenPasscodeSetThisDeviceOnly",
    WhenUnlockedThisDeviceOnly => "AccessibleWhenUnlockedThisDeviceOnly",
    AfterFirstUnlockThisDeviceOnly => "AccessibleAfterFirstUnlockThisDeviceOnly",
    AlwaysThisDeviceOnly => "AccessibleAlwaysThisDeviceOnly",
});

impl Accessible {
    /// `*ThisDeviceOnly` entries never appear in a backup export.
    pub fn is_this_device_only(&self) -> bool {
        matches!(
            self,
            Self::WhenPasscodeSetThisDeviceOnly
                | Self::WhenUnlockedThisDeviceOnly
                | Self::AfterFirstUnlockThisDeviceOnly
                | Self::AlwaysThisDeviceOnly
        )
    }
}

// ---------------------------------------------------------------------------
// AuthenticationType / BiometryType
// ---------------------------------------------------------------------------

/// Which authenticators a challenge may offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthenticationType {
    #[default]
    #[serde(rename = "AuthenticationWithBiometricsDevicePasscode")]
    DevicePasscodeOrBiometrics,
    #[serde(rename = "AuthenticationWithBiometrics")]
    Biometrics,
}

string_enum!(AuthenticationType, "authenticate_type", {
    DevicePasscodeOrBiometrics => "AuthenticationWithBiometricsDevicePasscode",
    Biometrics => "AuthenticationWithBiometrics",
});

/// Biometric sensor kind reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BiometryType {
    #[serde(rename = "TouchID")]
    TouchId,
    #[serde(rename = "FaceID")]
    FaceId,
    Fingerprint,
}

string_enum!(BiometryType, "biometry", {
    TouchId => "TouchID",
    FaceId => "FaceID",
    Fingerprint => "Fingerprint",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_forms_roundtrip() {
        for ac in AccessControl::ALL {
            assert_eq!(ac.as_str().parse::<AccessControl>().unwrap(), *ac);
        }
        for a in Accessible::ALL {
            assert_eq!(a.as_str().parse::<Accessible>().unwrap(), *a);
        }
        for t in AuthenticationType::ALL {
            assert_eq!(t.as_str().parse::<AuthenticationType>().unwrap(), *t);
        }
        for b in BiometryType::ALL {
            assert_eq!(b.as_str().parse::<BiometryType>().unwrap(), *b);
        }
    }

    #[test]
    fn serde_matches_display() {
        let json = serde_json::to_string(&Accessible::AlwaysThisDeviceOnly).unwrap();
        assert_eq!(json, "\"AccessibleAlwaysThisDeviceOnly\"");
        let json = serde_json::to_string(&BiometryType::FaceId).unwrap();
        assert_eq!(json, "\"FaceID\"");
        let parsed: AuthenticationType =
            serde_json::from_str("\"AuthenticationWithBiometrics\"").unwrap();
        assert_eq!(parsed, AuthenticationType::Biometrics);
    }

    #[test]
    fn unknown_value_is_invalid_option() {
        let err = "Sometimes".parse::<Accessible>().unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidOption { field: "accessible", .. }
        ));
    }

    #[test]
    fn this_device_only_variants() {
        let local: Vec<_> = Accessible::ALL
            .iter()
            .filter(|a| a.is_this_device_only())
            .collect();
        assert_eq!(local.len(), 4);
        assert!(!Accessible::WhenUnlocked.is_this_device_only());
    }

    #[test]
    fn biometry_classification() {
        assert!(AccessControl::BiometryAny.requires_biometry());
        assert!(!AccessControl::UserPresence.requires_biometry());
        assert!(AccessControl::BiometryAnyOrDevicePasscode.allows_passcode_fallback());
        assert!(!AccessControl::BiometryCurrentSet.allows_passcode_fallback());
        assert!(AccessControl::BiometryCurrentSetOrDevicePasscode.binds_biometry_set());
    }
}
