//! Terminal authenticator: answers passcode challenges on stdin.
//!
//! The passcode is taken from `SECURESTORE_PASSCODE` when set (for scripts,
//! typically via `.env`), otherwise read as one line from stdin.  An empty
//! line cancels the challenge.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use secure_storage::crypto::{self, PasscodeHash};
use secure_storage::platform::{
    AuthenticationChallenge, Authenticator, ChallengeKind, ChallengeOutcome, DeviceCapabilities,
    FailureReason,
};

/// Environment variable holding the passcode for non-interactive use.
pub const PASSCODE_ENV: &str = "SECURESTORE_PASSCODE";

/// Where challenge responses come from.
#[derive(Debug, Clone)]
pub enum PasscodeSource {
    /// A passcode supplied up front.
    Fixed(String),
    /// Prompt on stderr and read a line from stdin.
    Stdin,
}

impl PasscodeSource {
    /// `Fixed` from [`PASSCODE_ENV`] if set, otherwise `Stdin`.
    pub fn from_env() -> Self {
        match std::env::var(PASSCODE_ENV) {
            Ok(passcode) => Self::Fixed(passcode),
            Err(_) => Self::Stdin,
        }
    }

    /// Read one passcode.  `None` means the user gave no input.
    ///
    /// Fails with `UnexpectedEof` if stdin is already exhausted, e.g. after
    /// `securestore set KEY` consumed it for the value.
    pub async fn read(&self, prompt: &str) -> io::Result<Option<String>> {
        match self {
            Self::Fixed(passcode) => Ok(non_empty(passcode)),
            Self::Stdin => {
                let prompt = prompt.to_string();
                tokio::task::spawn_blocking(move || {
                    let mut stderr = io::stderr().lock();
                    write!(stderr, "{prompt}: ")?;
                    stderr.flush()?;
                    read_passcode_line(&mut io::stdin().lock())
                })
                .await
                .map_err(io::Error::other)?
            }
        }
    }
}

fn non_empty(line: &str) -> Option<String> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Read one line from `input`.  An empty line is `None`; end of input is an
/// error, since nobody is left to answer the prompt.
fn read_passcode_line(input: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stdin is closed; set {PASSCODE_ENV} to answer passcode prompts"),
        ));
    }
    Ok(non_empty(&line))
}

/// [`Authenticator`] backed by a configured passcode hash.
pub struct TerminalAuthenticator {
    capabilities: DeviceCapabilities,
    passcode: Option<Arc<PasscodeHash>>,
    source: PasscodeSource,
}

impl TerminalAuthenticator {
    pub fn new(
        capabilities: DeviceCapabilities,
        passcode: Option<PasscodeHash>,
        source: PasscodeSource,
    ) -> Self {
        Self {
            capabilities,
            passcode: passcode.map(Arc::new),
            source,
        }
    }
}

#[async_trait]
impl Authenticator for TerminalAuthenticator {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    async fn present_challenge(&self, challenge: &AuthenticationChallenge) -> ChallengeOutcome {
        if challenge.kind == ChallengeKind::Biometry {
            return ChallengeOutcome::Failure(FailureReason::Platform(
                "biometric match is not available in a terminal".into(),
            ));
        }

        let Some(stored) = self.passcode.clone() else {
            return ChallengeOutcome::Failure(FailureReason::Platform(
                "no passcode configured".into(),
            ));
        };

        let entered = match self.source.read(&challenge.prompt).await {
            Ok(Some(entered)) => entered,
            Ok(None) => return ChallengeOutcome::Cancelled,
            Err(e) => return ChallengeOutcome::Failure(FailureReason::Platform(e.to_string())),
        };

        // PBKDF2 verification is CPU-bound.
        let matched = tokio::task::spawn_blocking(move || {
            crypto::verify_passcode(entered.as_bytes(), &stored)
        })
        .await
        .unwrap_or(false);

        if matched {
            tracing::debug!(challenge_id = %challenge.id, "passcode accepted");
            ChallengeOutcome::Success
        } else {
            tracing::warn!(challenge_id = %challenge.id, key = %challenge.key, "passcode rejected");
            ChallengeOutcome::Failure(FailureReason::NotRecognized)
        }
    }
}
