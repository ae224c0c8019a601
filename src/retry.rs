//! Retry/backoff decisions for failed forwarding attempts.
//!
//! Pure logic with no access to the log or the network: the delivery
//! consumer asks, this module answers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before the message is dead-lettered.
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,

    /// Factor applied to the delay for every earlier failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
        }
    }
}

/// What to do with a message whose forward attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt again once the delay has elapsed.
    Retry(Duration),
    /// Retry budget exhausted: move to the dead-letter store.
    Escalate,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            multiplier,
        }
    }

    /// Decide based on the number of attempts that have already failed.
    ///
    /// `retry_count` excludes the attempt that just failed, so the first
    /// retry waits exactly `initial_delay`.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        decide(retry_count, self.max_retries, self.initial_delay, self.multiplier)
    }

    /// Delay sequence for every retry this policy allows.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|n| backoff_delay(self.initial_delay, self.multiplier, n)).collect()
    }
}

/// Free-function form of [`RetryPolicy::decide`].
pub fn decide(
    retry_count: u32,
    max_retries: u32,
    initial_delay: Duration,
    multiplier: f64,
) -> RetryDecision {
    if retry_count >= max_retries {
        return RetryDecision::Escalate;
    }
    RetryDecision::Retry(backoff_delay(initial_delay, multiplier, retry_count))
}

fn backoff_delay(initial_delay: Duration, multiplier: f64, exponent: u32) -> Duration {
    let factor = multiplier.powi(exponent.min(i32::MAX as u32) as i32);
    let millis = initial_delay.as_millis() as f64 * factor;
    if millis.is_nan() || millis <= 0.0 {
        return Duration::ZERO;
    }
    if millis >= u64::MAX as f64 {
        return Duration::from_millis(u64::MAX);
    }
    Duration::from_millis(millis.round() as u64)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
