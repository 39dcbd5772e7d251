//! Retry classification and backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::transport::TransportError;
use crate::config::duration_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed for retryable HTTP statuses.
    pub max_status_retries: u32,
    /// Retries allowed for reset/refused/timed-out connections.
    pub max_connection_retries: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_jitter: Duration,
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_status_retries: 3,
            max_connection_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            max_jitter: Duration::from_millis(1000),
            retry_statuses: vec![403, 429, 500, 502, 503, 504],
        }
    }
}

/// Why an attempt failed, as far as retrying is concerned.
#[derive(Debug, Clone)]
pub enum Failure {
    Status(u16),
    Transport(TransportError),
}

impl Failure {
    pub fn describe(&self) -> String {
        match self {
            Failure::Status(status) => format!("status {status}"),
            Failure::Transport(err) => err.to_string(),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Retry budget for a failure, `None` when it must not be retried.
    pub fn limit_for(&self, failure: &Failure) -> Option<u32> {
        match failure {
            Failure::Status(status) if self.is_retryable_status(*status) => {
                Some(self.max_status_retries)
            }
            Failure::Transport(err) if err.is_retryable() => Some(self.max_connection_retries),
            _ => None,
        }
    }

    /// `min(2^attempt * base, max) + jitter`, with `attempt` counted from zero.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        exponential + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(8000));
        assert_eq!(policy.backoff(4), Duration::from_millis(10_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..6 {
            let delay = policy.backoff(attempt);
            assert!(delay <= policy.max_delay + policy.max_jitter);
        }
    }

    #[test]
    fn classifies_failures() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.limit_for(&Failure::Status(503)), Some(3));
        assert_eq!(policy.limit_for(&Failure::Status(404)), None);
        assert_eq!(
            policy.limit_for(&Failure::Transport(TransportError::ConnectionReset("r".into()))),
            Some(5)
        );
        assert_eq!(
            policy.limit_for(&Failure::Transport(TransportError::Other("o".into()))),
            None
        );
    }
}
