use chrono::Utc;
use log::{error, info, warn};

use crate::{BatchError, repository::JobRepository};

use super::{
    build_name,
    context::ExecutionContext,
    execution::{BatchStatus, ExitStatus, JobExecution, JobParameters, StopSignal},
    listener::JobListener,
    step::Step,
};

/// Type alias for job execution results.
type JobResult<T> = Result<T, BatchError>;

/// Represents a job that can be executed.
///
/// A job is a sequence of steps run in order against a job repository. The
/// repository decides whether a launch creates a new job instance or
/// restarts an existing one, based on the job name and the identifying
/// parameters.
pub trait Job {
    fn get_name(&self) -> &str;

    /// Runs the job and returns the finished execution.
    ///
    /// # Returns
    /// - `Ok(JobExecution)` when the execution ends `COMPLETED` or `STOPPED`
    /// - `Err(BatchError::JobFailed)` carrying the execution when it ends in
    ///   any other status
    /// - any other `Err` when the launch itself is refused
    fn run(
        &self,
        repository: &dyn JobRepository,
        parameters: &JobParameters,
    ) -> JobResult<JobExecution>;
}

struct JobStep<'a> {
    step: &'a dyn Step,
    /// A failure of this step does not fail the job
    continue_on_failure: bool,
}

/// Job running its steps one after the other.
///
/// On restart, steps completed by a previous execution are skipped unless
/// they allow it, and the other steps resume from the context of their last
/// execution.
pub struct SimpleJob<'a> {
    name: String,
    steps: Vec<JobStep<'a>>,
    restartable: bool,
    listeners: Vec<&'a dyn JobListener>,
    stop_signal: StopSignal,
}

impl Job for SimpleJob<'_> {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        repository: &dyn JobRepository,
        parameters: &JobParameters,
    ) -> JobResult<JobExecution> {
        if !self.restartable && repository.get_job_instance(&self.name, parameters)?.is_some() {
            return Err(BatchError::JobRestart(format!(
                "job {} is not restartable",
                self.name
            )));
        }

        let mut job_execution = repository.create_job_execution(&self.name, parameters)?;
        self.stop_signal.reset();
        job_execution.set_stop_signal(self.stop_signal.clone());

        info!("Start of job: {}, id: {}", self.name, job_execution.id);

        job_execution.start_time = Some(Utc::now());
        job_execution.status = BatchStatus::Started;
        repository.update_job_execution(&mut job_execution)?;

        let mut tolerated = Vec::new();
        let outcome = self.execute(&mut job_execution, repository, &mut tolerated);

        match outcome {
            Ok(status) => job_execution.status = status,
            Err(error) => {
                error!("Job {} failed: {}", self.name, error);
                job_execution.add_failure(&error);
                job_execution.status = BatchStatus::Failed;
            }
        }

        if let Err(error) = self
            .listeners
            .iter()
            .try_for_each(|listener| listener.after_job(&job_execution))
        {
            error!("after_job listener of {} failed: {}", self.name, error);
            job_execution.add_failure(&error);
            job_execution.status = BatchStatus::Failed;
        }

        job_execution.end_time = Some(Utc::now());
        job_execution.exit_status = exit_status(&job_execution, &tolerated);

        if let Err(error) = repository.update_job_execution(&mut job_execution) {
            error!("Unable to persist end of job {}: {}", self.name, error);
            return Err(error);
        }

        info!(
            "End of job: {}, id: {}, status: {}",
            self.name, job_execution.id, job_execution.status
        );

        match job_execution.status {
            BatchStatus::Completed | BatchStatus::Stopped => Ok(job_execution),
            _ => Err(BatchError::JobFailed {
                job_name: self.name.clone(),
                execution: Box::new(job_execution),
            }),
        }
    }
}

impl SimpleJob<'_> {
    /// Asks the running execution to stop. Steps stop at the next chunk
    /// boundary and no further step is started.
    pub fn stop(&self) {
        info!("Stop requested for job {}", self.name);
        self.stop_signal.stop();
    }

    /// Handle for requesting a stop from another thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop_signal.clone()
    }

    fn execute(
        &self,
        job_execution: &mut JobExecution,
        repository: &dyn JobRepository,
        tolerated: &mut Vec<String>,
    ) -> JobResult<BatchStatus> {
        self.listeners
            .iter()
            .try_for_each(|listener| listener.before_job(job_execution))?;

        for job_step in &self.steps {
            if job_execution.is_stop_requested() {
                info!("Job {} stopped before step {}", self.name, job_step.step.get_name());
                return Ok(BatchStatus::Stopped);
            }

            let step = job_step.step;
            let Some((context, resumed_from)) = self.prepare_step(job_execution, repository, step)?
            else {
                continue;
            };

            let mut step_execution = repository.create_step_execution(
                job_execution,
                step.get_name(),
                context,
                resumed_from,
            )?;
            let result = step.execute(&mut step_execution, repository);
            let status = step_execution.status;
            job_execution.step_executions.push(step_execution);
            repository.update_job_execution_context(job_execution)?;

            match result {
                Ok(()) if status == BatchStatus::Stopped => return Ok(BatchStatus::Stopped),
                Ok(()) => {}
                Err(error) if job_step.continue_on_failure && status != BatchStatus::Unknown => {
                    warn!(
                        "Step {} failed, continuing job {}: {}",
                        step.get_name(),
                        self.name,
                        error
                    );
                    tolerated.push(step.get_name().to_string());
                }
                Err(error) => return Err(error),
            }
        }

        Ok(BatchStatus::Completed)
    }

    /// Applies the restart rules of a step.
    ///
    /// Returns the context the step starts from and the execution it resumes,
    /// or `None` when the step must be skipped.
    fn prepare_step(
        &self,
        job_execution: &mut JobExecution,
        repository: &dyn JobRepository,
        step: &dyn Step,
    ) -> JobResult<Option<(ExecutionContext, Option<u64>)>> {
        let step_name = step.get_name();
        let instance = job_execution.job_instance.clone();

        let mut context = ExecutionContext::new();
        let mut resumed_from = None;

        if let Some(last) = repository.get_last_step_execution(&instance, step_name)? {
            match last.status {
                BatchStatus::Completed if !step.allow_start_if_complete() => {
                    info!("Step {} already completed, skipping", step_name);
                    job_execution.skipped_steps.push(step_name.to_string());
                    return Ok(None);
                }
                BatchStatus::Completed => {}
                BatchStatus::Abandoned => {
                    return Err(BatchError::JobRestart(format!(
                        "step {} was abandoned and cannot be restarted",
                        step_name
                    )));
                }
                _ => {
                    info!("Resuming step {} from execution {}", step_name, last.id);
                    context = last.execution_context;
                    resumed_from = Some(last.id);
                }
            }
        }

        let limit = step.start_limit();
        if repository.get_step_execution_count(&instance, step_name)? >= limit {
            return Err(BatchError::StartLimitExceeded {
                step_name: step_name.to_string(),
                limit,
            });
        }

        Ok(Some((context, resumed_from)))
    }
}

fn exit_status(job_execution: &JobExecution, tolerated: &[String]) -> ExitStatus {
    let exit_status = ExitStatus::for_status(job_execution.status);
    if !job_execution.failure_exceptions.is_empty() {
        exit_status.with_description(job_execution.failure_exceptions.join("; "))
    } else if !tolerated.is_empty() {
        exit_status.with_description(format!(
            "completed with failed steps: {}",
            tolerated.join(", ")
        ))
    } else {
        exit_status
    }
}

/// Builder for creating a job.
///
/// # Example
///
/// ```rust,no_run,compile_fail
/// use spring_batch_engine::core::job::JobBuilder;
///
/// let job = JobBuilder::new()
///     .name("import-customers".to_string())
///     .start(&read_step)
///     .next(&process_step)
///     .next_allowing_failure(&report_step)
///     .build();
/// ```
pub struct JobBuilder<'a> {
    /// Optional name for the job (generated randomly if not specified)
    name: Option<String>,
    steps: Vec<JobStep<'a>>,
    restartable: bool,
    listeners: Vec<&'a dyn JobListener>,
}

impl Default for JobBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> JobBuilder<'a> {
    pub fn new() -> Self {
        Self {
            name: None,
            steps: Vec::new(),
            restartable: true,
            listeners: Vec::new(),
        }
    }

    pub fn name(mut self, name: String) -> JobBuilder<'a> {
        self.name = Some(name);
        self
    }

    /// Sets the first step of the job. Same as [`next`](JobBuilder::next).
    pub fn start(self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.next(step)
    }

    pub fn next(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(JobStep {
            step,
            continue_on_failure: false,
        });
        self
    }

    /// Adds a step whose failure is recorded without failing the job.
    pub fn next_allowing_failure(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(JobStep {
            step,
            continue_on_failure: true,
        });
        self
    }

    /// A job that is not restartable refuses to launch an existing instance again.
    pub fn restartable(mut self, restartable: bool) -> JobBuilder<'a> {
        self.restartable = restartable;
        self
    }

    pub fn listener(mut self, listener: &'a dyn JobListener) -> JobBuilder<'a> {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> SimpleJob<'a> {
        SimpleJob {
            name: self.name.unwrap_or_else(build_name),
            steps: self.steps,
            restartable: self.restartable,
            listeners: self.listeners,
            stop_signal: StopSignal::new(),
        }
    }
}
