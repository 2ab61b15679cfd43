//! Requeue delays with configurable backoff and jitter.
//!
//! A failed attempt classified as retryable is requeued after
//! [`RetryPolicy::delay_for`]; the job's own `max_retries` bounds how often.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ErrorClass;

/// Backoff strategy for requeue delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to spread requeued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry budget given to jobs submitted without one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_max_retries() -> u32 {
    crate::core::DEFAULT_MAX_RETRIES
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    5 * 60 * 1_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after the delay.
    Retry(Duration),
    /// Budget exhausted; dead-letter.
    GiveUp,
    /// The failure is not worth retrying.
    NotRetryable,
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Un-jittered delay before retry number `retry_count + 1`.
    #[must_use]
    pub fn backoff_ms(&self, retry_count: u32) -> u64 {
        let base = self.base_delay_ms;
        let delay = match self.backoff {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(retry_count))
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry_count) + 1),
            BackoffStrategy::Constant => base,
        };
        delay.min(self.max_delay_ms)
    }

    /// Delay before the job becomes visible again.
    ///
    /// `previous` is the delay used for the prior retry, consulted only by
    /// decorrelated jitter.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32, previous: Option<Duration>) -> Duration {
        let delay = self.backoff_ms(retry_count);
        let mut rng = rand::thread_rng();

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rng.gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rng.gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let base = self.base_delay_ms.min(self.max_delay_ms);
                let prev = previous
                    .map_or(base, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
                let upper = prev.saturating_mul(3).min(self.max_delay_ms);
                if upper <= base {
                    base
                } else {
                    rng.gen_range(base..=upper)
                }
            }
        };

        Duration::from_millis(jittered)
    }

    /// Decides the fate of a failed attempt.
    ///
    /// `retry_count` is the number of retries already consumed.
    #[must_use]
    pub fn decide(&self, class: ErrorClass, retry_count: u32, max_retries: u32) -> RetryDecision {
        if !class.is_retryable() {
            return RetryDecision::NotRetryable;
        }
        if retry_count >= max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(retry_count, None))
    }
}
