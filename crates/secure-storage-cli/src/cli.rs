//! CLI argument definitions for `securestore`.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use secure_storage::{AccessControl, Accessible, AuthenticationType, StoreOptions};

/// securestore -- encrypted credential storage with access control.
#[derive(Parser)]
#[command(
    name = "securestore",
    version,
    about = "securestore -- encrypted credential storage with access control",
    long_about = "Stores small secrets under (service, key) pairs, encrypted at rest with \
                  AES-256-GCM. Entries may require a passcode before they are released."
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, global = true, default_value = "securestore.toml")]
    pub config: PathBuf,

    /// Path to the entry database.  Overrides `data_dir` from the config.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub options: OptionArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store a value.
    Set {
        key: String,
        /// Value to store.  Read from stdin when omitted; replacing a
        /// protected entry then needs `SECURESTORE_PASSCODE`, since stdin is
        /// no longer available for the passcode prompt.
        value: Option<String>,
    },

    /// Print a stored value.
    Get { key: String },

    /// Remove a stored value.
    Remove { key: String },

    /// List every key under the service.
    Keys,

    /// Report whether the configured authentication can be performed.
    CanAuth,

    /// Print the enrolled biometry type, or `none`.
    Biometry,

    /// Export backup-eligible entries as JSON.  Values stay encrypted.
    Export {
        /// Output file.  Writes to stdout when omitted.
        #[arg(long, short)]
        out: Option<PathBuf>,
    },

    /// Hash a new passcode and print the `passcode_hash` config line.
    SetPasscode,
}

/// Per-call storage options, accepted by every subcommand.
#[derive(Args, Default)]
pub struct OptionArgs {
    /// Namespace for the entry.
    #[arg(long, global = true)]
    pub service: Option<String>,

    /// Access control, e.g. `DevicePasscode` or `BiometryAnyOrDevicePasscode`.
    #[arg(long, global = true)]
    pub access_control: Option<AccessControl>,

    /// Accessibility, e.g. `AccessibleAfterFirstUnlock`.
    #[arg(long, global = true)]
    pub accessible: Option<Accessible>,

    #[arg(long, global = true)]
    pub access_group: Option<String>,

    /// Message shown when authentication is required.
    #[arg(long, global = true)]
    pub prompt: Option<String>,

    /// `AuthenticationWithBiometricsDevicePasscode` or
    /// `AuthenticationWithBiometrics`.
    #[arg(long, global = true)]
    pub auth_type: Option<AuthenticationType>,
}

impl OptionArgs {
    pub fn to_store_options(&self) -> StoreOptions {
        StoreOptions {
            access_control: self.access_control,
            accessible: self.accessible,
            access_group: self.access_group.clone(),
            authentication_prompt: self.prompt.clone(),
            service: self.service.clone(),
            authenticate_type: self.auth_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "securestore",
            "get",
            "token",
            "--service",
            "github",
            "--access-control",
            "DevicePasscode",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::Get { ref key } if key == "token"));
        let opts = cli.options.to_store_options();
        assert_eq!(opts.service.as_deref(), Some("github"));
        assert_eq!(opts.access_control, Some(AccessControl::DevicePasscode));
        assert!(opts.accessible.is_none());
    }

    #[test]
    fn rejects_unknown_access_control() {
        let result = Cli::try_parse_from([
            "securestore",
            "set",
            "k",
            "v",
            "--access-control",
            "Retina",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn set_value_is_optional() {
        let cli = Cli::try_parse_from(["securestore", "set", "k"]).unwrap();
        assert!(matches!(cli.command, Commands::Set { value: None, .. }));
        assert_eq!(cli.config, PathBuf::from("securestore.toml"));
    }
}
