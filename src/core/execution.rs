use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BatchError;

use super::context::ExecutionContext;

/// Status of a job or step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Status of a batch job prior to its execution.
    Starting,
    /// Status of a batch job that is running.
    Started,
    /// Status of batch job waiting for a step to complete before stopping the batch job.
    Stopping,
    /// Status of a batch job that has been stopped by request.
    Stopped,
    /// The batch job has successfully completed its execution.
    Completed,
    /// Status of a batch job that has failed during its execution.
    Failed,
    /// Status of a batch job that did not stop properly and can not be restarted.
    Abandoned,
    /// Status of a batch job that is in an uncertain state.
    Unknown,
}

impl BatchStatus {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    pub fn is_unsuccessful(&self) -> bool {
        matches!(
            self,
            BatchStatus::Failed | BatchStatus::Abandoned | BatchStatus::Unknown
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Stopped
                | BatchStatus::Abandoned
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = BatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "STARTING" => Ok(BatchStatus::Starting),
            "STARTED" => Ok(BatchStatus::Started),
            "STOPPING" => Ok(BatchStatus::Stopping),
            "STOPPED" => Ok(BatchStatus::Stopped),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            "ABANDONED" => Ok(BatchStatus::Abandoned),
            "UNKNOWN" => Ok(BatchStatus::Unknown),
            other => Err(BatchError::Repository(format!(
                "unknown batch status: {}",
                other
            ))),
        }
    }
}

/// Exit code and human readable description of a finished execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_code: String,
    pub exit_description: String,
}

impl ExitStatus {
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const STOPPED: &'static str = "STOPPED";
    pub const FAILED: &'static str = "FAILED";
    pub const UNKNOWN: &'static str = "UNKNOWN";

    pub fn new(exit_code: &str) -> Self {
        Self {
            exit_code: exit_code.to_string(),
            exit_description: String::new(),
        }
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP)
    }

    /// Exit status matching the final batch status.
    pub fn for_status(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Completed => Self::completed(),
            BatchStatus::Stopped | BatchStatus::Stopping => Self::stopped(),
            BatchStatus::Failed | BatchStatus::Abandoned => Self::failed(),
            BatchStatus::Starting | BatchStatus::Started => Self::executing(),
            BatchStatus::Unknown => Self::unknown(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.exit_description = description.into();
        self
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::executing()
    }
}

/// A single job parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobParameter {
    String(String),
    Long(i64),
    Double(f64),
}

impl fmt::Display for JobParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobParameter::String(value) => write!(f, "{}", value),
            JobParameter::Long(value) => write!(f, "{}", value),
            JobParameter::Double(value) => write!(f, "{}", value),
        }
    }
}

/// Parameters identifying a job instance.
///
/// Two launches of the same job with equal parameters target the same
/// [`JobInstance`], which is what makes a failed run restartable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_string(mut self, key: &str, value: &str) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::String(value.to_string()));
        self
    }

    pub fn with_long(mut self, key: &str, value: i64) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::Long(value));
        self
    }

    pub fn with_double(mut self, key: &str, value: f64) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::Double(value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.parameters.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Stable identifying key, `k1=v1;k2=v2` in key order.
    pub fn to_key(&self) -> String {
        self.parameters
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: u64,
    pub job_name: String,
    pub job_key: String,
}

/// Advisory stop request shared by a job and the steps it runs.
///
/// The flag is only observed between chunks, so a chunk in flight always
/// reaches its commit or rollback before the stop takes effect.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}

/// Counters gathered while a chunk is processed.
///
/// A contribution is only applied to its [`StepExecution`] once the chunk
/// commits, so a rolled back chunk never shows up in the step counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepContribution {
    pub read_count: usize,
    pub write_count: usize,
    pub filter_count: usize,
    pub read_skip_count: usize,
    pub process_skip_count: usize,
    pub write_skip_count: usize,
}

impl StepContribution {
    pub fn skip_count(&self) -> usize {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }
}

/// Execution record of one attempt of a step.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub id: u64,
    /// Owning job execution
    pub job_execution_id: u64,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    /// Number of items successfully read
    pub read_count: usize,
    /// Number of items successfully written
    pub write_count: usize,
    /// Number of items filtered out by the processor
    pub filter_count: usize,
    pub commit_count: usize,
    pub rollback_count: usize,
    pub read_skip_count: usize,
    pub process_skip_count: usize,
    pub write_skip_count: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Time of the last persisted update, used to detect stale executions
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    pub failure_exceptions: Vec<String>,
    /// Step execution whose context this attempt resumed from
    pub resumed_from: Option<u64>,
    pub version: u32,
    pub(crate) stop_signal: StopSignal,
}

impl StepExecution {
    pub fn new(id: u64, job_execution_id: u64, step_name: &str) -> Self {
        Self {
            id,
            job_execution_id,
            step_name: step_name.to_string(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            commit_count: 0,
            rollback_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            failure_exceptions: Vec::new(),
            resumed_from: None,
            version: 0,
            stop_signal: StopSignal::new(),
        }
    }

    pub fn skip_count(&self) -> usize {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn apply(&mut self, contribution: &StepContribution) {
        self.read_count += contribution.read_count;
        self.write_count += contribution.write_count;
        self.filter_count += contribution.filter_count;
        self.read_skip_count += contribution.read_skip_count;
        self.process_skip_count += contribution.process_skip_count;
        self.write_skip_count += contribution.write_skip_count;
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_signal.is_stopped()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop_signal.clone()
    }

    pub(crate) fn set_stop_signal(&mut self, signal: StopSignal) {
        self.stop_signal = signal;
    }

    /// Whether this attempt carried forward the context of a previous one.
    pub fn is_resumed(&self) -> bool {
        self.resumed_from.is_some()
    }

    pub fn add_failure(&mut self, error: &BatchError) {
        self.failure_exceptions.push(error.to_string());
    }
}

/// Execution record of one run of a job instance.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub id: u64,
    pub job_instance: JobInstance,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    /// Step executions of this run, in execution order
    pub step_executions: Vec<StepExecution>,
    /// Steps not executed because a previous run already completed them
    pub skipped_steps: Vec<String>,
    pub failure_exceptions: Vec<String>,
    pub version: u32,
    pub(crate) stop_signal: StopSignal,
}

impl JobExecution {
    pub fn new(id: u64, job_instance: JobInstance, parameters: JobParameters) -> Self {
        Self {
            id,
            job_instance,
            parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
            skipped_steps: Vec::new(),
            failure_exceptions: Vec::new(),
            version: 0,
            stop_signal: StopSignal::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_instance.job_name
    }

    pub fn step_execution(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions
            .iter()
            .rev()
            .find(|step| step.step_name == step_name)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_signal.is_stopped()
    }

    pub(crate) fn set_stop_signal(&mut self, signal: StopSignal) {
        self.stop_signal = signal;
    }

    pub fn add_failure(&mut self, error: &BatchError) {
        self.failure_exceptions.push(error.to_string());
    }
}
