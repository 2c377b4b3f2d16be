use log::warn;

use crate::BatchError;

use super::classifier::ErrorClassifier;

/// Decides whether the item behind a failure is skipped instead of failing
/// the chunk.
///
/// `skip_count` is the number of items already skipped in the current step
/// execution, across all committed chunks plus the chunk in flight.
pub trait SkipPolicy: Send + Sync {
    fn should_skip(&self, error: &BatchError, skip_count: usize) -> bool;

    /// Whether the error is skippable at all, ignoring any limit.
    fn is_skippable(&self, error: &BatchError) -> bool {
        self.should_skip(error, 0)
    }
}

/// Skips classified errors until `skip_limit` items have been skipped.
#[derive(Debug, Clone)]
pub struct LimitCheckingSkipPolicy {
    skip_limit: usize,
    classifier: ErrorClassifier<bool>,
}

impl LimitCheckingSkipPolicy {
    pub fn new(skip_limit: usize, classifier: ErrorClassifier<bool>) -> Self {
        Self {
            skip_limit,
            classifier,
        }
    }

    pub fn skip_limit(&self) -> usize {
        self.skip_limit
    }
}

impl SkipPolicy for LimitCheckingSkipPolicy {
    fn should_skip(&self, error: &BatchError, skip_count: usize) -> bool {
        if !self.classifier.classify(error) {
            return false;
        }
        if skip_count >= self.skip_limit {
            warn!(
                "Skip limit of {} reached, {} is now fatal",
                self.skip_limit, error
            );
            return false;
        }
        true
    }

    fn is_skippable(&self, error: &BatchError) -> bool {
        self.skip_limit > 0 && self.classifier.classify(error)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSkipPolicy;

impl SkipPolicy for NeverSkipPolicy {
    fn should_skip(&self, _error: &BatchError, _skip_count: usize) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSkipPolicy;

impl SkipPolicy for AlwaysSkipPolicy {
    fn should_skip(&self, _error: &BatchError, _skip_count: usize) -> bool {
        true
    }
}
