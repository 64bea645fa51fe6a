use std::ops::RangeInclusive;

use rand::Rng;
use tokio::time::Duration;

use crate::classifier::ErrorCategory;
use crate::config::Config;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub rate_limit_base_delay: Duration,
    /// Random pause inserted before every publish call.
    pub pre_publish_jitter: RangeInclusive<Duration>,
    /// Recent items fetched when confirming whether a publish landed.
    pub confirmation_lookback: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            rate_limit_base_delay: Duration::from_secs(600),
            pre_publish_jitter: Duration::from_secs(20)..=Duration::from_secs(40),
            confirmation_lookback: 5,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_delay_seconds),
            rate_limit_base_delay: Duration::from_secs(config.rate_limit_base_delay_seconds),
            pre_publish_jitter: Duration::from_secs(config.pre_publish_jitter_min_seconds)
                ..=Duration::from_secs(config.pre_publish_jitter_max_seconds),
            confirmation_lookback: config.confirmation_lookback,
        }
    }

    /// Delay before attempt `attempt + 1`, after attempt `attempt` failed
    /// with `category`. Linear in the attempt number.
    pub fn backoff_delay(&self, category: ErrorCategory, attempt: u32) -> Duration {
        let base = match category {
            ErrorCategory::RateLimited => self.rate_limit_base_delay,
            _ => self.base_delay,
        };
        base.saturating_mul(attempt.max(1))
    }

    pub fn publish_jitter(&self) -> Duration {
        random_between(&self.pre_publish_jitter)
    }
}

/// Uniform pick inside an inclusive range, millisecond resolution.
pub fn random_between(range: &RangeInclusive<Duration>) -> Duration {
    let low = range.start().as_millis() as u64;
    let high = range.end().as_millis() as u64;
    if high <= low {
        return *range.start();
    }
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}
