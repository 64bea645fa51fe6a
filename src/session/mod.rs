// Session acquisition: persisted session reuse and the login strategy chain
//
// The remote auth library is an external collaborator; everything here talks
// to it through `RemoteAuthClient`.

pub mod chain;
pub mod store;

use std::fmt;
use std::io::{self, BufRead, Write};

use async_trait::async_trait;

use crate::classifier::RawSignal;

pub use chain::{LoginContext, LoginStrategy, LoginStrategyChain, StrategyResult};
pub use store::{ByteStore, FileByteStore, MemoryByteStore, SessionStore};

/// Opaque serialized authentication state (cookies, tokens, device settings).
#[derive(Clone, PartialEq, Eq)]
pub struct SessionBlob(Vec<u8>);

impl SessionBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Never print session contents.
impl fmt::Debug for SessionBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionBlob({} bytes)", self.0.len())
    }
}

/// Account credentials, fixed for the lifetime of the process.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub manual_session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field(
                "manual_session_token",
                &self.manual_session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// A session that passed a live verification call.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub account: String,
    pub blob: SessionBlob,
    /// Name of the strategy that produced this session.
    pub source: &'static str,
}

/// Result of a username/password login.
#[derive(Debug, Clone)]
pub enum LoginReply {
    Session(SessionBlob),
    /// The remote wants an out-of-band code before issuing a session.
    SecondFactorRequired,
}

#[async_trait]
pub trait RemoteAuthClient: Send + Sync {
    /// Cheap authenticated call (own profile or timeline) proving the session works.
    async fn verify(&self, session: &SessionBlob) -> Result<(), RawSignal>;

    async fn login(&self, username: &str, password: &str) -> Result<LoginReply, RawSignal>;

    async fn login_with_token(&self, token: &str) -> Result<SessionBlob, RawSignal>;

    async fn submit_second_factor(
        &self,
        username: &str,
        code: &str,
    ) -> Result<SessionBlob, RawSignal>;
}

/// Synchronous source of second-factor codes supplied by the caller.
pub trait SecondFactorPrompt: Send + Sync {
    /// Returns `None` when no code can be obtained.
    fn request_code(&self, account: &str) -> Option<String>;
}

/// Reads the code from the controlling terminal.
pub struct TerminalPrompt;

impl SecondFactorPrompt for TerminalPrompt {
    fn request_code(&self, account: &str) -> Option<String> {
        print!("Enter 2FA code for @{}: ", account);
        if let Err(e) = io::stdout().flush() {
            log::warn!("Failed to flush prompt: {}", e);
        }

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => {
                let code = line.trim().to_string();
                (!code.is_empty()).then_some(code)
            }
            Err(e) => {
                log::error!("Failed to read 2FA code: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_secrets() {
        let creds = Credentials {
            username: "reels".into(),
            password: Some("hunter2".into()),
            manual_session_token: Some("sessionid=abc".into()),
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("reels"));
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("sessionid=abc"));

        let blob = SessionBlob::new(b"cookie=secret".to_vec());
        assert_eq!(format!("{:?}", blob), "SessionBlob(13 bytes)");
    }
}
