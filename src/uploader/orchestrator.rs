//! Publish state machine.
//!
//! Each attempt moves through `Authenticating -> Publishing` and then either
//! succeeds or is classified; the category decides between retrying after a
//! backoff and aborting. Cancellation is honoured between attempts and during
//! pauses, never while a publish call is in flight.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use super::retry::RetryPolicy;
use super::{ClipUpload, PublishReceipt, RecentItem, RemotePublishClient};
use crate::classifier::{bounded, classify, ErrorCategory, RawSignal};
use crate::session::{AuthenticatedSession, LoginStrategyChain};

/// Allowed clock difference between us and the remote when matching items.
const CONFIRMATION_SKEW_SECS: i64 = 120;

/// The account's recent items as seen before the first upload of a run.
/// Anything already listed here cannot be the clip being published.
#[derive(Debug)]
enum Baseline {
    Known(HashSet<String>),
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "category")]
pub enum AttemptOutcome {
    Succeeded,
    Failed(ErrorCategory),
}

/// Per-attempt bookkeeping. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub delay_before_next: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub succeeded: bool,
    pub remote_identifier: Option<String>,
    pub terminal_reason: Option<ErrorCategory>,
    pub cancelled: bool,
    pub attempts: Vec<AttemptRecord>,
}

impl PublishOutcome {
    fn success(remote_identifier: Option<String>, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            succeeded: true,
            remote_identifier,
            terminal_reason: None,
            cancelled: false,
            attempts,
        }
    }

    fn failure(reason: ErrorCategory, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            succeeded: false,
            remote_identifier: None,
            terminal_reason: Some(reason),
            cancelled: false,
            attempts,
        }
    }

    fn cancelled(last: Option<ErrorCategory>, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            succeeded: false,
            remote_identifier: None,
            terminal_reason: last,
            cancelled: true,
            attempts,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

pub struct UploadOrchestrator {
    chain: LoginStrategyChain,
    publisher: Arc<dyn RemotePublishClient>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl UploadOrchestrator {
    pub fn new(
        chain: LoginStrategyChain,
        publisher: Arc<dyn RemotePublishClient>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chain,
            publisher,
            policy,
            cancel,
        }
    }

    /// Publish one clip, retrying per the classified failure, for at most
    /// `max_attempts` attempts.
    pub async fn publish(&self, clip: &ClipUpload, max_attempts: u32) -> PublishOutcome {
        let max_attempts = max_attempts.max(1);
        let mut records: Vec<AttemptRecord> = Vec::new();
        let mut last_category: Option<ErrorCategory> = None;
        // Set when a failed attempt may still have landed remotely.
        let mut unconfirmed_dispatch: Option<DateTime<Utc>> = None;
        // Taken once, before the first upload of the run.
        let mut snapshot: Option<Baseline> = None;

        log::info!(
            "📤 Publishing {} (max {} attempts)",
            clip.video.display(),
            max_attempts
        );

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                log::info!("Publish cancelled before attempt {}", attempt);
                return PublishOutcome::cancelled(last_category, records);
            }

            // Authenticating
            let session = match self.chain.authenticate().await {
                Ok(session) => session,
                Err(e) => {
                    let category = match e.category() {
                        ErrorCategory::ChallengeRequired => ErrorCategory::ChallengeRequired,
                        _ => ErrorCategory::SessionExpired,
                    };
                    log::error!("❌ Login failed on attempt {}: {}", attempt, e);
                    last_category = Some(category);
                    if let Some(outcome) = self
                        .settle_failure(attempt, max_attempts, category, &mut records)
                        .await
                    {
                        return outcome;
                    }
                    continue;
                }
            };

            let baseline: &Baseline = match snapshot.take() {
                Some(known) => snapshot.insert(known),
                None => snapshot.insert(self.snapshot_recent(&session).await),
            };

            if let Some(since) = unconfirmed_dispatch.take() {
                if let Some(item) = self.confirm_landed(&session, since, baseline).await {
                    log::info!(
                        "Previous attempt landed as {}; not publishing again",
                        item.identifier
                    );
                    self.record(&mut records, attempt, AttemptOutcome::Succeeded, None);
                    return PublishOutcome::success(Some(item.identifier), records);
                }
            }

            // Publishing
            let jitter = self.policy.publish_jitter();
            log::info!("⏳ Pre-publish pause: {:?}", jitter);
            if !self.pause(jitter).await {
                log::info!("Publish cancelled during pre-publish pause");
                return PublishOutcome::cancelled(last_category, records);
            }

            let dispatched_at = Utc::now();
            let result = bounded(
                self.chain.call_timeout(),
                "clip upload",
                true,
                self.publisher.publish(&session, clip),
            )
            .await;

            let signal = match result {
                Ok(PublishReceipt {
                    identifier: Some(identifier),
                }) => {
                    log::info!("🎉 Published {} as {}", clip.video.display(), identifier);
                    self.record(&mut records, attempt, AttemptOutcome::Succeeded, None);
                    return PublishOutcome::success(Some(identifier), records);
                }
                Ok(PublishReceipt { identifier: None }) => {
                    RawSignal::new("publish returned without a media identifier")
                }
                Err(signal) => signal,
            };

            // Classifying
            let category = classify(&signal);
            log::warn!(
                "Publish attempt {} failed ({}): {}",
                attempt,
                category,
                signal
            );
            last_category = Some(category);

            match category {
                ErrorCategory::AmbiguousSuccess => {
                    // Resolved as success whether or not the item shows up.
                    let confirmed = self.confirm_landed(&session, dispatched_at, baseline).await;
                    match &confirmed {
                        Some(item) => log::info!("✅ Publish confirmed as {}", item.identifier),
                        None => log::info!("✅ Publish assumed successful (unconfirmed)"),
                    }
                    self.record(&mut records, attempt, AttemptOutcome::Succeeded, None);
                    return PublishOutcome::success(confirmed.map(|i| i.identifier), records);
                }
                ErrorCategory::SessionExpired => {
                    self.chain.store().invalidate();
                }
                _ => {}
            }

            if signal.dispatched {
                unconfirmed_dispatch = Some(dispatched_at);
            }

            if let Some(outcome) = self
                .settle_failure(attempt, max_attempts, category, &mut records)
                .await
            {
                return outcome;
            }
        }

        // The last attempt always returns through settle_failure.
        PublishOutcome::failure(last_category.unwrap_or(ErrorCategory::Fatal), records)
    }

    /// Record a failed attempt and either stop (terminal category, attempts
    /// exhausted, cancelled) or wait out the backoff.
    async fn settle_failure(
        &self,
        attempt: u32,
        max_attempts: u32,
        category: ErrorCategory,
        records: &mut Vec<AttemptRecord>,
    ) -> Option<PublishOutcome> {
        if !category.is_retryable() {
            self.record(records, attempt, AttemptOutcome::Failed(category), None);
            if category.is_terminal() {
                log::error!("Aborting publish: {} needs intervention", category);
            } else {
                log::error!("Aborting publish: {} is not retryable", category);
            }
            return Some(PublishOutcome::failure(category, std::mem::take(records)));
        }

        if attempt >= max_attempts {
            self.record(records, attempt, AttemptOutcome::Failed(category), None);
            log::error!("Giving up after {} attempts ({})", attempt, category);
            return Some(PublishOutcome::failure(category, std::mem::take(records)));
        }

        let delay = self.policy.backoff_delay(category, attempt);
        self.record(records, attempt, AttemptOutcome::Failed(category), Some(delay));
        if !self.pause(delay).await {
            log::info!("Publish cancelled during backoff");
            return Some(PublishOutcome::cancelled(
                Some(category),
                std::mem::take(records),
            ));
        }
        None
    }

    fn record(
        &self,
        records: &mut Vec<AttemptRecord>,
        attempt: u32,
        outcome: AttemptOutcome,
        delay_before_next: Option<Duration>,
    ) {
        let record = AttemptRecord {
            attempt_number: attempt,
            outcome,
            delay_before_next,
        };
        log::info!(
            "Attempt {}: {:?}, next in {:?}",
            record.attempt_number,
            record.outcome,
            record.delay_before_next
        );
        records.push(record);
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    async fn fetch_recent(
        &self,
        session: &AuthenticatedSession,
    ) -> Result<Vec<RecentItem>, RawSignal> {
        bounded(
            self.chain.call_timeout(),
            "recent items lookup",
            false,
            self.publisher.recent_items(
                session,
                &session.account,
                self.policy.confirmation_lookback,
            ),
        )
        .await
    }

    async fn snapshot_recent(&self, session: &AuthenticatedSession) -> Baseline {
        match self.fetch_recent(session).await {
            Ok(items) => {
                log::debug!("{} recent items before publishing", items.len());
                Baseline::Known(items.into_iter().map(|item| item.identifier).collect())
            }
            Err(signal) => {
                log::warn!("Recent items snapshot failed (non-critical): {}", signal);
                Baseline::Unavailable
            }
        }
    }

    /// Look for the item a dispatch at `since` produced.
    ///
    /// With a baseline, only items missing from it qualify. Without one, the
    /// item needs a timestamp at or after `since`, with no skew allowance, so
    /// an older post is never mistaken for this one.
    async fn confirm_landed(
        &self,
        session: &AuthenticatedSession,
        since: DateTime<Utc>,
        baseline: &Baseline,
    ) -> Option<RecentItem> {
        let items = match self.fetch_recent(session).await {
            Ok(items) => items,
            Err(signal) => {
                log::warn!("Confirmation read failed (non-critical): {}", signal);
                return None;
            }
        };

        let cutoff = since - chrono::Duration::seconds(CONFIRMATION_SKEW_SECS);
        items.into_iter().find(|item| match baseline {
            Baseline::Known(seen) => {
                !seen.contains(&item.identifier)
                    && item.published_at.map_or(true, |at| at >= cutoff)
            }
            Baseline::Unavailable => item.published_at.is_some_and(|at| at >= since),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        Credentials, LoginContext, LoginReply, MemoryByteStore, RemoteAuthClient,
        SecondFactorPrompt, SessionBlob, SessionStore,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct AcceptingAuth;

    #[async_trait]
    impl RemoteAuthClient for AcceptingAuth {
        async fn verify(&self, _session: &SessionBlob) -> Result<(), RawSignal> {
            Ok(())
        }
        async fn login(&self, _u: &str, _p: &str) -> Result<LoginReply, RawSignal> {
            Ok(LoginReply::Session(SessionBlob::new(b"fresh".to_vec())))
        }
        async fn login_with_token(&self, _t: &str) -> Result<SessionBlob, RawSignal> {
            Err(RawSignal::new("unused"))
        }
        async fn submit_second_factor(&self, _u: &str, _c: &str) -> Result<SessionBlob, RawSignal> {
            Err(RawSignal::new("unused"))
        }
    }

    struct NoPrompt;

    impl SecondFactorPrompt for NoPrompt {
        fn request_code(&self, _account: &str) -> Option<String> {
            None
        }
    }

    #[derive(Default)]
    struct ScriptedPublisher {
        publishes: Mutex<VecDeque<Result<PublishReceipt, RawSignal>>>,
        recent: Mutex<Vec<RecentItem>>,
        recent_fails: bool,
        publish_calls: Mutex<u32>,
    }

    impl ScriptedPublisher {
        fn scripted(results: Vec<Result<PublishReceipt, RawSignal>>) -> Self {
            Self {
                publishes: Mutex::new(results.into()),
                ..Default::default()
            }
        }

        fn publish_calls(&self) -> u32 {
            *self.publish_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl RemotePublishClient for ScriptedPublisher {
        async fn publish(
            &self,
            _session: &AuthenticatedSession,
            _clip: &ClipUpload,
        ) -> Result<PublishReceipt, RawSignal> {
            *self.publish_calls.lock().unwrap() += 1;
            self.publishes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(RawSignal::new("connection reset")))
        }

        async fn recent_items(
            &self,
            _session: &AuthenticatedSession,
            _account: &str,
            limit: usize,
        ) -> Result<Vec<RecentItem>, RawSignal> {
            if self.recent_fails {
                return Err(RawSignal::new("connection refused"));
            }
            Ok(self.recent.lock().unwrap().iter().take(limit).cloned().collect())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(10),
            rate_limit_base_delay: Duration::from_secs(100),
            pre_publish_jitter: Duration::from_secs(1)..=Duration::from_secs(2),
            confirmation_lookback: 3,
        }
    }

    fn orchestrator(
        publisher: Arc<ScriptedPublisher>,
        backend: Arc<MemoryByteStore>,
        cancel: CancellationToken,
    ) -> UploadOrchestrator {
        let chain = LoginStrategyChain::standard(LoginContext {
            credentials: Credentials {
                username: "reels".into(),
                password: Some("pw".into()),
                manual_session_token: None,
            },
            store: SessionStore::new(backend, "reels"),
            auth: Arc::new(AcceptingAuth),
            prompt: Arc::new(NoPrompt),
            call_timeout: Duration::from_secs(60),
        });
        UploadOrchestrator::new(chain, publisher, policy(), cancel)
    }

    fn clip() -> ClipUpload {
        ClipUpload {
            video: PathBuf::from("output/clip.mp4"),
            caption: "#cars".into(),
            cover: None,
        }
    }

    fn receipt(id: &str) -> Result<PublishReceipt, RawSignal> {
        Ok(PublishReceipt {
            identifier: Some(id.into()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_uses_the_larger_backoff() {
        let publisher = Arc::new(ScriptedPublisher::scripted(vec![
            Err(RawSignal::new("feedback_required: spam")),
            receipt("C0DE"),
        ]));
        let orch = orchestrator(
            publisher.clone(),
            Arc::new(MemoryByteStore::new()),
            CancellationToken::new(),
        );

        let outcome = orch.publish(&clip(), 3).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.remote_identifier.as_deref(), Some("C0DE"));
        assert_eq!(
            outcome.attempts[0],
            AttemptRecord {
                attempt_number: 1,
                outcome: AttemptOutcome::Failed(ErrorCategory::RateLimited),
                delay_before_next: Some(Duration::from_secs(100)),
            }
        );
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn session_expiry_invalidates_and_reauthenticates() {
        let publisher = Arc::new(ScriptedPublisher::scripted(vec![
            Err(RawSignal::new("login_required").with_code(403)),
            receipt("AFTER"),
        ]));
        let backend = Arc::new(MemoryByteStore::new());
        let orch = orchestrator(publisher.clone(), backend.clone(), CancellationToken::new());

        let outcome = orch.publish(&clip(), 3).await;
        assert!(outcome.succeeded);
        assert_eq!(backend.removals(), 1);
        // Password login ran once per attempt, persisting each session.
        assert_eq!(backend.writes(), 2);
        assert_eq!(
            outcome.attempts[0].delay_before_next,
            Some(Duration::from_secs(10))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispatched_failure_is_rechecked_before_republishing() {
        let publisher = Arc::new(ScriptedPublisher::scripted(vec![Err(RawSignal::new(
            "clip upload timed out after 60s",
        )
        .after_dispatch())]));
        let orch = orchestrator(
            publisher.clone(),
            Arc::new(MemoryByteStore::new()),
            CancellationToken::new(),
        );

        // The earlier upload shows up on the account before attempt 2.
        let landed = RecentItem {
            identifier: "LANDED".into(),
            published_at: Some(Utc::now()),
        };
        let p = publisher.clone();
        let outcome = {
            let c = clip();
            let fut = orch.publish(&c, 3);
            tokio::pin!(fut);
            tokio::select! {
                biased;
                out = &mut fut => out,
                _ = async {
                    // Land the item while attempt 1 is backing off.
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    p.recent.lock().unwrap().push(landed.clone());
                    std::future::pending::<()>().await
                } => unreachable!(),
            }
        };

        assert!(outcome.succeeded);
        assert_eq!(outcome.remote_identifier.as_deref(), Some("LANDED"));
        assert_eq!(publisher.publish_calls(), 1);
        assert_eq!(outcome.attempt_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_identifier_is_fatal() {
        let publisher = Arc::new(ScriptedPublisher::scripted(vec![Ok(PublishReceipt {
            identifier: None,
        })]));
        let orch = orchestrator(
            publisher.clone(),
            Arc::new(MemoryByteStore::new()),
            CancellationToken::new(),
        );

        let outcome = orch.publish(&clip(), 3).await;
        assert!(!outcome.succeeded);
        assert_eq!(outcome.terminal_reason, Some(ErrorCategory::Fatal));
        assert_eq!(publisher.publish_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_further_attempts() {
        let publisher = Arc::new(ScriptedPublisher::scripted(vec![Err(RawSignal::new(
            "connection reset by peer",
        ))]));
        let cancel = CancellationToken::new();
        let orch = orchestrator(
            publisher.clone(),
            Arc::new(MemoryByteStore::new()),
            cancel.clone(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            // Past the first jitter (<= 2s), inside the 10s backoff.
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let outcome = orch.publish(&clip(), 3).await;
        assert!(!outcome.succeeded);
        assert!(outcome.cancelled);
        assert_eq!(outcome.terminal_reason, Some(ErrorCategory::TransientNetwork));
        assert_eq!(publisher.publish_calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_calls() {
        let publisher = Arc::new(ScriptedPublisher::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let orch = orchestrator(publisher.clone(), Arc::new(MemoryByteStore::new()), cancel);

        let outcome = orch.publish(&clip(), 3).await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.terminal_reason, None);
        assert!(outcome.attempts.is_empty());
        assert_eq!(publisher.publish_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn older_post_on_the_account_is_not_taken_for_this_clip() {
        let publisher = Arc::new(ScriptedPublisher::scripted(vec![
            Err(RawSignal::new("clip upload: connection closed").after_dispatch()),
            receipt("FRESH"),
        ]));
        publisher.recent.lock().unwrap().push(RecentItem {
            identifier: "YESTERDAYS".into(),
            published_at: Some(Utc::now() - chrono::Duration::seconds(90)),
        });
        let orch = orchestrator(
            publisher.clone(),
            Arc::new(MemoryByteStore::new()),
            CancellationToken::new(),
        );

        let outcome = orch.publish(&clip(), 3).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.remote_identifier.as_deref(), Some("FRESH"));
        assert_eq!(publisher.publish_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_success_stands_without_confirmation() {
        let publisher = Arc::new(ScriptedPublisher::scripted(vec![Err(RawSignal::new(
            "2 validation errors for ClipResponse",
        )
        .after_dispatch())]));
        let orch = orchestrator(
            publisher.clone(),
            Arc::new(MemoryByteStore::new()),
            CancellationToken::new(),
        );

        let outcome = orch.publish(&clip(), 3).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.remote_identifier, None);
        assert_eq!(outcome.attempt_count(), 1);
        assert_eq!(publisher.publish_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_success_stands_when_recent_items_fail() {
        let publisher = Arc::new(ScriptedPublisher {
            recent_fails: true,
            ..ScriptedPublisher::scripted(vec![Err(RawSignal::new(
                "pydantic_core._pydantic_core.ValidationError",
            )
            .after_dispatch())])
        });
        let orch = orchestrator(
            publisher.clone(),
            Arc::new(MemoryByteStore::new()),
            CancellationToken::new(),
        );

        let outcome = orch.publish(&clip(), 3).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.remote_identifier, None);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Succeeded);
        assert_eq!(publisher.publish_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn without_a_snapshot_only_newer_items_confirm() {
        let publisher = Arc::new(ScriptedPublisher {
            recent_fails: true,
            ..ScriptedPublisher::scripted(vec![
                Err(RawSignal::new("clip upload timed out after 60s").after_dispatch()),
                receipt("SECOND"),
            ])
        });
        let orch = orchestrator(
            publisher.clone(),
            Arc::new(MemoryByteStore::new()),
            CancellationToken::new(),
        );

        // The failed lookup cannot prove the first upload landed.
        let outcome = orch.publish(&clip(), 3).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.remote_identifier.as_deref(), Some("SECOND"));
        assert_eq!(publisher.publish_calls(), 2);
    }
}
