//! Ordered login strategies.
//!
//! The chain tries each strategy once, in order, and stops at the first one
//! that yields a verified session. It never retries on its own; pacing
//! repeated logins is the orchestrator's job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    AuthenticatedSession, Credentials, LoginReply, RemoteAuthClient, SecondFactorPrompt,
    SessionBlob, SessionStore,
};
use crate::classifier::{bounded, classify, ErrorCategory, RawSignal};
use crate::errors::{AppError, AppResult};

/// Everything a strategy may use. Owned by the chain.
pub struct LoginContext {
    pub credentials: Credentials,
    pub store: SessionStore,
    pub auth: Arc<dyn RemoteAuthClient>,
    pub prompt: Arc<dyn SecondFactorPrompt>,
    pub call_timeout: Duration,
}

impl LoginContext {
    async fn verify(&self, blob: &SessionBlob) -> Result<(), RawSignal> {
        bounded(
            self.call_timeout,
            "session verification",
            false,
            self.auth.verify(blob),
        )
        .await
    }

    /// Verify a freshly issued session and persist it.
    async fn accept(
        &self,
        blob: SessionBlob,
        source: &'static str,
    ) -> Result<AuthenticatedSession, RawSignal> {
        if let Err(signal) = self.verify(&blob).await {
            return Err(RawSignal {
                message: format!("login accepted but verification failed: {}", signal.message),
                ..signal
            });
        }

        if let Err(e) = self.store.save(&blob) {
            log::warn!("Failed to persist session (continuing with live session): {}", e);
        }

        Ok(AuthenticatedSession {
            account: self.credentials.username.clone(),
            blob,
            source,
        })
    }
}

#[derive(Debug)]
pub enum StrategyResult {
    Authenticated(AuthenticatedSession),
    /// The strategy has nothing to try (no cached session, no token, ...).
    Skipped,
    Failed(RawSignal),
}

#[async_trait]
pub trait LoginStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, ctx: &LoginContext) -> StrategyResult;
}

/// Reuse the persisted session if it still verifies.
pub struct CachedSession;

#[async_trait]
impl LoginStrategy for CachedSession {
    fn name(&self) -> &'static str {
        "cached_session"
    }

    async fn attempt(&self, ctx: &LoginContext) -> StrategyResult {
        let Some(blob) = ctx.store.load() else {
            return StrategyResult::Skipped;
        };

        match ctx.verify(&blob).await {
            Ok(()) => StrategyResult::Authenticated(AuthenticatedSession {
                account: ctx.credentials.username.clone(),
                blob,
                source: self.name(),
            }),
            Err(signal) => {
                // A stale session is never tried twice.
                ctx.store.invalidate();
                StrategyResult::Failed(signal)
            }
        }
    }
}

/// Log in with a session token copied from a browser.
pub struct ManualToken;

#[async_trait]
impl LoginStrategy for ManualToken {
    fn name(&self) -> &'static str {
        "manual_session_token"
    }

    async fn attempt(&self, ctx: &LoginContext) -> StrategyResult {
        let Some(token) = ctx.credentials.manual_session_token.as_deref() else {
            return StrategyResult::Skipped;
        };

        let issued = bounded(
            ctx.call_timeout,
            "session token login",
            false,
            ctx.auth.login_with_token(token),
        )
        .await;

        match issued {
            Ok(blob) => match ctx.accept(blob, self.name()).await {
                Ok(session) => StrategyResult::Authenticated(session),
                Err(signal) => StrategyResult::Failed(signal),
            },
            Err(signal) => {
                log::warn!("Session token rejected; a fresh token may be needed");
                StrategyResult::Failed(signal)
            }
        }
    }
}

/// Username/password login, including the second-factor exchange.
pub struct PasswordLogin;

#[async_trait]
impl LoginStrategy for PasswordLogin {
    fn name(&self) -> &'static str {
        "password"
    }

    async fn attempt(&self, ctx: &LoginContext) -> StrategyResult {
        let Some(password) = ctx.credentials.password.as_deref() else {
            return StrategyResult::Skipped;
        };
        let username = ctx.credentials.username.as_str();

        let reply = bounded(
            ctx.call_timeout,
            "password login",
            false,
            ctx.auth.login(username, password),
        )
        .await;

        let blob = match reply {
            Ok(LoginReply::Session(blob)) => blob,
            Ok(LoginReply::SecondFactorRequired) => {
                log::info!("Second factor required for @{}", username);
                let Some(code) = ctx.prompt.request_code(username) else {
                    return StrategyResult::Failed(RawSignal::new(
                        "second factor required but no code was provided",
                    ));
                };
                match bounded(
                    ctx.call_timeout,
                    "second factor submission",
                    false,
                    ctx.auth.submit_second_factor(username, &code),
                )
                .await
                {
                    Ok(blob) => blob,
                    Err(signal) => return StrategyResult::Failed(signal),
                }
            }
            Err(signal) => return StrategyResult::Failed(signal),
        };

        match ctx.accept(blob, self.name()).await {
            Ok(session) => StrategyResult::Authenticated(session),
            Err(signal) => StrategyResult::Failed(signal),
        }
    }
}

pub struct LoginStrategyChain {
    ctx: LoginContext,
    strategies: Vec<Box<dyn LoginStrategy>>,
}

impl LoginStrategyChain {
    pub fn new(ctx: LoginContext, strategies: Vec<Box<dyn LoginStrategy>>) -> Self {
        Self { ctx, strategies }
    }

    /// Cached session, then manual token, then password (with second factor).
    pub fn standard(ctx: LoginContext) -> Self {
        Self::new(
            ctx,
            vec![
                Box::new(CachedSession),
                Box::new(ManualToken),
                Box::new(PasswordLogin),
            ],
        )
    }

    pub fn store(&self) -> &SessionStore {
        &self.ctx.store
    }

    pub fn call_timeout(&self) -> Duration {
        self.ctx.call_timeout
    }

    /// Produce a verified session or a definitive failure.
    ///
    /// The failure carries the category of the last signal seen, or
    /// `Fatal` when every strategy was skipped.
    pub async fn authenticate(&self) -> AppResult<AuthenticatedSession> {
        let mut last_failure: Option<RawSignal> = None;

        for strategy in &self.strategies {
            match strategy.attempt(&self.ctx).await {
                StrategyResult::Authenticated(session) => {
                    log::info!(
                        "✅ Authenticated @{} via {}",
                        session.account,
                        strategy.name()
                    );
                    return Ok(session);
                }
                StrategyResult::Skipped => {
                    log::debug!("Login strategy {} skipped", strategy.name());
                }
                StrategyResult::Failed(signal) => {
                    log::warn!(
                        "Login strategy {} failed ({}): {}",
                        strategy.name(),
                        classify(&signal),
                        signal
                    );
                    last_failure = Some(signal);
                }
            }
        }

        Err(match last_failure {
            Some(signal) => AppError::authentication_failed(classify(&signal), &signal.message),
            None => AppError::authentication_failed(
                ErrorCategory::Fatal,
                "no login strategy was applicable",
            ),
        })
    }
}
