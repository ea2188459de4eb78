//! Retry policy with exponential backoff

use std::time::Duration;

use serde::Deserialize;

use crate::error::ApiError;

/// Which failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryCondition {
    /// Network failures and 5xx; never 4xx
    #[default]
    Transient,
    /// Every failure except cancellation and a terminated session
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub max_retries: u32,
    pub base_delay: Duration,
    pub condition: RetryCondition,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            condition: RetryCondition::Transient,
        }
    }

    pub fn condition(mut self, condition: RetryCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn should_retry(&self, error: &ApiError) -> bool {
        if error.is_final() {
            return false;
        }
        match self.condition {
            RetryCondition::Transient => error.is_transient(),
            RetryCondition::Always => true,
        }
    }

    /// `base_delay * 2^attempt`, saturating.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (0-based), or `None` once retries are exhausted or the error is final.
    pub fn next_delay(&self, attempt: u32, error: &ApiError) -> Option<Duration> {
        if attempt >= self.max_retries || !self.should_retry(error) {
            return None;
        }
        Some(self.backoff(attempt))
    }
}
