use std::time::Duration;

use log::debug;
use serde::Deserialize;

use crate::BatchError;

use super::classifier::ErrorClassifier;

/// Decides whether a failed operation is attempted again.
///
/// `attempt` is the number of failed attempts so far for the current
/// operation, starting at 1. The caller resets it once the operation
/// succeeds or is abandoned to the skip policy.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, error: &BatchError, attempt: usize) -> bool;

    /// Delay to wait before the next attempt.
    fn backoff(&self, _attempt: usize) -> Duration {
        Duration::ZERO
    }
}

/// Delay strategy between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackOff {
    #[default]
    None,
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl BackOff {
    pub fn delay(&self, attempt: usize) -> Duration {
        match *self {
            BackOff::None => Duration::ZERO,
            BackOff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackOff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.max(1) - 1;
                let raw = initial_ms as f64 * multiplier.powi(exponent as i32);
                Duration::from_millis(raw.min(max_ms as f64) as u64)
            }
        }
    }
}

/// Retries classified errors up to `retry_limit` times.
///
/// An operation is therefore attempted at most `retry_limit + 1` times.
#[derive(Debug, Clone)]
pub struct SimpleRetryPolicy {
    retry_limit: usize,
    classifier: ErrorClassifier<bool>,
    back_off: BackOff,
}

impl SimpleRetryPolicy {
    pub fn new(retry_limit: usize, classifier: ErrorClassifier<bool>) -> Self {
        Self {
            retry_limit,
            classifier,
            back_off: BackOff::None,
        }
    }

    pub fn with_back_off(mut self, back_off: BackOff) -> Self {
        self.back_off = back_off;
        self
    }

    pub fn retry_limit(&self) -> usize {
        self.retry_limit
    }

    pub fn is_retryable(&self, error: &BatchError) -> bool {
        self.classifier.classify(error)
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn should_retry(&self, error: &BatchError, attempt: usize) -> bool {
        if attempt > self.retry_limit {
            return false;
        }
        let retryable = self.is_retryable(error);
        if retryable {
            debug!(
                "Retrying after attempt {}/{}: {}",
                attempt,
                self.retry_limit + 1,
                error
            );
        }
        retryable
    }

    fn backoff(&self, attempt: usize) -> Duration {
        self.back_off.delay(attempt)
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetryPolicy;

impl RetryPolicy for NeverRetryPolicy {
    fn should_retry(&self, _error: &BatchError, _attempt: usize) -> bool {
        false
    }
}
