use serde::Deserialize;

use crate::BatchError;

use super::{
    classifier::ErrorClassifier,
    retry::{BackOff, SimpleRetryPolicy},
    skip::LimitCheckingSkipPolicy,
};

/// Fault tolerance configuration of a chunk-oriented step.
///
/// Settings can be built in code through the step builder or loaded from
/// JSON. Patterns are matched against [`BatchError::kind`]. When a limit is
/// set and no pattern is listed, every error counts.
///
/// ```
/// use spring_batch_engine::core::settings::FaultToleranceSettings;
///
/// let settings = FaultToleranceSettings::from_json(r#"{
///     "chunk_size": 100,
///     "skip_limit": 10,
///     "skippable": ["parse.*"],
///     "retry_limit": 3,
///     "retryable": ["db.Deadlock*"],
///     "backoff": { "type": "fixed", "delay_ms": 50 }
/// }"#).unwrap();
///
/// assert_eq!(settings.chunk_size, 100);
/// assert!(settings.scan_on_write_failure);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FaultToleranceSettings {
    pub chunk_size: usize,
    pub skip_limit: usize,
    pub skippable: Vec<String>,
    pub non_skippable: Vec<String>,
    pub retry_limit: usize,
    pub retryable: Vec<String>,
    pub non_retryable: Vec<String>,
    pub backoff: BackOff,
    /// Write items one by one after a failed chunk write to find the culprit.
    /// When disabled, a failed chunk write fails the step.
    pub scan_on_write_failure: bool,
}

impl Default for FaultToleranceSettings {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            skip_limit: 0,
            skippable: Vec::new(),
            non_skippable: Vec::new(),
            retry_limit: 0,
            retryable: Vec::new(),
            non_retryable: Vec::new(),
            backoff: BackOff::None,
            scan_on_write_failure: true,
        }
    }
}

impl FaultToleranceSettings {
    pub fn from_json(json: &str) -> Result<Self, BatchError> {
        let settings: FaultToleranceSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if self.chunk_size == 0 {
            return Err(BatchError::Configuration(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn skip_policy(&self) -> LimitCheckingSkipPolicy {
        LimitCheckingSkipPolicy::new(
            self.skip_limit,
            ErrorClassifier::from_patterns(&self.skippable, &self.non_skippable),
        )
    }

    pub fn retry_policy(&self) -> SimpleRetryPolicy {
        SimpleRetryPolicy::new(
            self.retry_limit,
            ErrorClassifier::from_patterns(&self.retryable, &self.non_retryable),
        )
        .with_back_off(self.backoff)
    }
}
