//! Retry policy with configurable backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RetryPolicy {
    /// Total attempts, counting the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Full jitter: the actual sleep is uniform in `[0, delay]`.
    pub jitter: bool,
    /// Substrings of error text that make a failure retryable.
    pub retryable_errors: Vec<String>,
    pub retryable_exit_codes: Vec<i32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::Exponential,
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: true,
            retryable_errors: default_retryable_errors(),
            retryable_exit_codes: vec![1],
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(30_000)
}

fn default_retryable_errors() -> Vec<String> {
    vec!["timeout".to_string(), "ECONNREFUSED".to_string()]
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, i.e. after the `attempt`-th
    /// failure: `min(max_delay, base_delay * 2^(attempt-1))` for exponential
    /// backoff, `base_delay` for fixed. Jitter is applied separately.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1u32 << exponent)
            }
        };
        raw.min(self.max_delay)
    }

    /// Apply full jitter when enabled.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let mut rng = rand::rng();
        Duration::from_secs_f64(rng.random_range(0.0..=delay.as_secs_f64()))
    }

    /// A failure is retryable when its error text matches any configured
    /// substring or its exit code is listed.
    pub fn is_retryable(&self, error: Option<&str>, exit_code: Option<i32>) -> bool {
        if let Some(code) = exit_code {
            if self.retryable_exit_codes.contains(&code) {
                return true;
            }
        }
        if let Some(error) = error {
            if self
                .retryable_errors
                .iter()
                .any(|needle| error.contains(needle.as_str()))
            {
                return true;
            }
        }
        false
    }
}
