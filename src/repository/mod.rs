//! Persistence of job and step executions.
//!
//! The repository is the single source of truth for execution identity and
//! status. Every record carries a version: an update only succeeds when the
//! caller holds the current version, and bumps it. A stale update fails with
//! [`BatchError::OptimisticLock`], so two workers can never both own the same
//! running execution.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::{
    BatchError,
    core::{
        context::ExecutionContext,
        execution::{BatchStatus, JobExecution, JobInstance, JobParameters, StepExecution},
    },
};

/// In-memory repository, useful for tests and single process deployments.
pub mod memory;

#[cfg(feature = "rdbc-sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "rdbc-sqlite")))]
/// SQLite repository built on sqlx.
pub mod sqlite;

pub use memory::InMemoryJobRepository;

#[cfg(feature = "rdbc-sqlite")]
pub use sqlite::SqliteJobRepository;

pub trait JobRepository: Send + Sync {
    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, BatchError>;

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, BatchError>;

    /// Creates a new execution of the instance identified by name and
    /// parameters, creating the instance on first launch.
    ///
    /// Fails when the last execution of the instance is still running,
    /// completed or abandoned. The job context of the last execution is
    /// carried forward.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError>;

    fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError>;

    fn update_job_execution_context(
        &self,
        job_execution: &mut JobExecution,
    ) -> Result<(), BatchError>;

    /// Loads an execution with its step executions.
    fn get_job_execution(&self, id: u64) -> Result<Option<JobExecution>, BatchError>;

    fn create_step_execution(
        &self,
        job_execution: &JobExecution,
        step_name: &str,
        context: ExecutionContext,
        resumed_from: Option<u64>,
    ) -> Result<StepExecution, BatchError>;

    /// Persists the record and, when dirty, its context as one unit.
    fn update_step_execution(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<(), BatchError>;

    fn update_step_execution_context(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<(), BatchError>;

    /// Most recent execution of a step across all runs of the instance.
    fn get_last_step_execution(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, BatchError>;

    fn get_step_execution_count(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, BatchError>;
}

/// What to do with the last execution of an instance before a new launch.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RestartCheck {
    Restart,
    RecoverStale,
}

pub(crate) const STALE_DESCRIPTION: &str = "recovered stale execution";

/// Launch rules shared by repository implementations.
///
/// `last_activity` is the most recent update of the execution or any of
/// its steps.
pub(crate) fn check_restart(
    last: &JobExecution,
    last_activity: Option<DateTime<Utc>>,
    stale_timeout: Option<Duration>,
) -> Result<RestartCheck, BatchError> {
    let name = format!(
        "{} [{}] execution {}",
        last.job_name(),
        last.job_instance.job_key,
        last.id
    );

    match last.status {
        status if status.is_running() => {
            if is_stale(last_activity.or(Some(last.create_time)), stale_timeout) {
                warn!("Execution {} looks stale, marking it FAILED", name);
                Ok(RestartCheck::RecoverStale)
            } else {
                Err(BatchError::JobExecutionAlreadyRunning(name))
            }
        }
        BatchStatus::Completed => Err(BatchError::JobInstanceAlreadyComplete(name)),
        BatchStatus::Abandoned => Err(BatchError::JobRestart(format!(
            "{} was abandoned and cannot be restarted",
            name
        ))),
        _ => {
            info!("Restarting {}", name);
            Ok(RestartCheck::Restart)
        }
    }
}

fn is_stale(last_activity: Option<DateTime<Utc>>, stale_timeout: Option<Duration>) -> bool {
    let (Some(last_activity), Some(timeout)) = (last_activity, stale_timeout) else {
        return false;
    };
    match chrono::Duration::from_std(timeout) {
        Ok(timeout) => Utc::now() - last_activity >= timeout,
        Err(_) => false,
    }
}

pub(crate) fn stale_failure(status: &mut BatchStatus) -> bool {
    if status.is_running() {
        *status = BatchStatus::Failed;
        true
    } else {
        false
    }
}

pub(crate) fn check_version(
    entity: &'static str,
    id: u64,
    expected: u32,
    found: u32,
) -> Result<(), BatchError> {
    if expected == found {
        Ok(())
    } else {
        Err(BatchError::OptimisticLock {
            entity,
            id,
            expected,
            found,
        })
    }
}
