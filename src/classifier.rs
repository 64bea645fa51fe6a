//! Maps raw remote failures onto the fixed set of [`ErrorCategory`] values.
//!
//! Rules are evaluated top to bottom and the first match wins. Raw messages
//! from the remote client are free-form and often match several patterns at
//! once (a malformed success payload can mention "login" or "limit" fields),
//! so the order below is part of the contract.

use std::fmt;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    SessionExpired,
    ChallengeRequired,
    RateLimited,
    AmbiguousSuccess,
    TransientNetwork,
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::SessionExpired => "session_expired",
            ErrorCategory::ChallengeRequired => "challenge_required",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::AmbiguousSuccess => "ambiguous_success",
            ErrorCategory::TransientNetwork => "transient_network",
            ErrorCategory::Fatal => "fatal",
        }
    }

    /// Recovered locally by another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::SessionExpired
                | ErrorCategory::RateLimited
                | ErrorCategory::TransientNetwork
        )
    }

    /// Ends the publish run immediately, whatever attempts remain.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorCategory::ChallengeRequired | ErrorCategory::Fatal)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure as reported by a remote capability, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSignal {
    pub message: String,
    /// HTTP-style status code when the remote answered at all.
    pub code: Option<u16>,
    /// The request left this process before the failure was observed, so the
    /// remote may have acted on it.
    pub dispatched: bool,
}

impl RawSignal {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            dispatched: false,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn after_dispatch(mut self) -> Self {
        self.dispatched = true;
        self
    }
}

impl fmt::Display for RawSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Run a remote call under a deadline.
///
/// An expired deadline becomes a timeout signal, which classifies as
/// `TransientNetwork`. `dispatched` says whether the remote may already have
/// acted on the request by then.
pub async fn bounded<T, F>(
    limit: Duration,
    what: &str,
    dispatched: bool,
    call: F,
) -> Result<T, RawSignal>
where
    F: Future<Output = Result<T, RawSignal>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RawSignal {
            message: format!("{} timed out after {:?}", what, limit),
            code: None,
            dispatched,
        }),
    }
}

struct Rule {
    category: ErrorCategory,
    pattern: Regex,
    codes: &'static [u16],
    requires_dispatch: bool,
}

impl Rule {
    fn matches(&self, signal: &RawSignal) -> bool {
        if self.requires_dispatch && !signal.dispatched {
            return false;
        }
        let code_hit = signal.code.is_some_and(|c| self.codes.contains(&c));
        code_hit || self.pattern.is_match(&signal.message)
    }
}

fn rule(
    category: ErrorCategory,
    pattern: &str,
    codes: &'static [u16],
    requires_dispatch: bool,
) -> Rule {
    Rule {
        category,
        // Literal patterns below are covered by the unit tests.
        pattern: Regex::new(pattern).expect("classifier pattern must compile"),
        codes,
        requires_dispatch,
    }
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            rule(
                ErrorCategory::AmbiguousSuccess,
                r"(?i)pydantic|validation ?error|validationerror|failed to (parse|decode)|json ?decode|malformed|unexpected (response|payload)|invalid (response|payload)",
                &[],
                true,
            ),
            rule(
                ErrorCategory::SessionExpired,
                r"(?i)login_required|login required|session (has )?expired|session (is )?invalid|invalid session|user_has_logged_out|not authori[sz]ed|unauthori[sz]ed",
                &[401],
                false,
            ),
            rule(
                ErrorCategory::ChallengeRequired,
                r"(?i)challenge|checkpoint|verification required|verify (your|it'?s) (account|identity|you)|consent_required",
                &[],
                false,
            ),
            rule(
                ErrorCategory::RateLimited,
                r"(?i)rate.?limit|too many requests|throttl|quota|spam|feedback_required|please wait|\blimit\b",
                &[429],
                false,
            ),
            rule(
                ErrorCategory::TransientNetwork,
                r"(?i)timed? ?out|timeout|connection (reset|refused|aborted|closed|failed)|broken pipe|temporarily unavailable|service unavailable|bad gateway|unexpected eof|dns|network (is )?unreachable",
                &[408, 500, 502, 503, 504],
                false,
            ),
        ]
    })
}

/// Assign exactly one category to a raw failure. Pure and deterministic.
pub fn classify(signal: &RawSignal) -> ErrorCategory {
    rules()
        .iter()
        .find(|rule| rule.matches(signal))
        .map(|rule| rule.category)
        .unwrap_or(ErrorCategory::Fatal)
}
