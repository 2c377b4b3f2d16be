use std::fmt;

use thiserror::Error;

use crate::core::execution::JobExecution;

/// Failure raised by an item collaborator (reader, processor or writer).
///
/// The `kind` is the name used by error classifiers to decide whether the
/// failure is retryable or skippable. It is either the Rust type name of the
/// underlying error or an explicit dotted name chosen by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    kind: String,
    message: String,
}

impl ItemError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Builds an item error from any error value, using its type name as kind.
    ///
    /// ```
    /// use spring_batch_engine::ItemError;
    ///
    /// let io = std::io::Error::other("disk full");
    /// let error = ItemError::from_error(&io);
    /// assert_eq!(error.kind(), "std::io::error::Error");
    /// ```
    pub fn from_error<E: std::error::Error + 'static>(error: &E) -> Self {
        Self::new(std::any::type_name::<E>(), error.to_string())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Error, Debug)]
/// Batch error
pub enum BatchError {
    #[error("ItemReader from: {0}")]
    ItemReader(ItemError),

    #[error("ItemProcessor from: {0}")]
    ItemProcessor(ItemError),

    #[error("ItemWriter from: {0}")]
    ItemWriter(ItemError),

    #[error("Listener {hook} failed: {message}")]
    Listener { hook: &'static str, message: String },

    #[error("Skip limit exceeded after {skip_count} skips: {source}")]
    SkipLimitExceeded {
        skip_count: usize,
        #[source]
        source: Box<BatchError>,
    },

    #[error("Retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<BatchError>,
    },

    #[error("Step {0} failed")]
    Step(String),

    #[error("Job {job_name} ended with status {}", execution.status)]
    JobFailed {
        job_name: String,
        execution: Box<JobExecution>,
    },

    #[error("Optimistic locking failure on {entity} {id}: expected version {expected}, found {found}")]
    OptimisticLock {
        entity: &'static str,
        id: u64,
        expected: u32,
        found: u32,
    },

    #[error("A job execution for this instance is already running: {0}")]
    JobExecutionAlreadyRunning(String),

    #[error("Job instance already complete: {0}")]
    JobInstanceAlreadyComplete(String),

    #[error("Job restart refused: {0}")]
    JobRestart(String),

    #[error("Start limit of {limit} exceeded for step {step_name}")]
    StartLimitExceeded { step_name: String, limit: usize },

    #[error("Job repository error: {0}")]
    Repository(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BatchError {
    /// Name used by error classifiers.
    ///
    /// Item errors expose the kind of the wrapped [`ItemError`]; every other
    /// variant is identified by its variant name.
    pub fn kind(&self) -> &str {
        match self {
            BatchError::ItemReader(error)
            | BatchError::ItemProcessor(error)
            | BatchError::ItemWriter(error) => error.kind(),
            BatchError::Listener { .. } => "Listener",
            BatchError::SkipLimitExceeded { .. } => "SkipLimitExceeded",
            BatchError::RetryExhausted { .. } => "RetryExhausted",
            BatchError::Step(_) => "Step",
            BatchError::JobFailed { .. } => "JobFailed",
            BatchError::OptimisticLock { .. } => "OptimisticLock",
            BatchError::JobExecutionAlreadyRunning(_) => "JobExecutionAlreadyRunning",
            BatchError::JobInstanceAlreadyComplete(_) => "JobInstanceAlreadyComplete",
            BatchError::JobRestart(_) => "JobRestart",
            BatchError::StartLimitExceeded { .. } => "StartLimitExceeded",
            BatchError::Repository(_) => "Repository",
            BatchError::Transaction(_) => "Transaction",
            BatchError::Configuration(_) => "Configuration",
            BatchError::Serialization(_) => "Serialization",
        }
    }

    pub fn reader(kind: impl Into<String>, message: impl Into<String>) -> Self {
        BatchError::ItemReader(ItemError::new(kind, message))
    }

    pub fn processor(kind: impl Into<String>, message: impl Into<String>) -> Self {
        BatchError::ItemProcessor(ItemError::new(kind, message))
    }

    pub fn writer(kind: impl Into<String>, message: impl Into<String>) -> Self {
        BatchError::ItemWriter(ItemError::new(kind, message))
    }

    pub fn listener(hook: &'static str, error: impl fmt::Display) -> Self {
        BatchError::Listener {
            hook,
            message: error.to_string(),
        }
    }
}
