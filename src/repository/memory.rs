use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::debug;

use crate::{
    BatchError,
    core::{
        context::ExecutionContext,
        execution::{ExitStatus, JobExecution, JobInstance, JobParameters, StepExecution},
    },
};

use super::{
    JobRepository, RestartCheck, STALE_DESCRIPTION, check_restart, check_version, stale_failure,
};

#[derive(Default)]
struct RepositoryState {
    next_instance_id: u64,
    next_job_execution_id: u64,
    next_step_execution_id: u64,
    instances: Vec<JobInstance>,
    /// Stored without their step executions
    job_executions: BTreeMap<u64, JobExecution>,
    step_executions: BTreeMap<u64, StepExecution>,
}

impl RepositoryState {
    fn find_instance(&self, job_name: &str, job_key: &str) -> Option<&JobInstance> {
        self.instances
            .iter()
            .find(|instance| instance.job_name == job_name && instance.job_key == job_key)
    }

    fn last_job_execution(&self, instance_id: u64) -> Option<&JobExecution> {
        self.job_executions
            .values()
            .rev()
            .find(|execution| execution.job_instance.id == instance_id)
    }

    fn steps_of(&self, job_execution_id: u64) -> impl Iterator<Item = &StepExecution> {
        self.step_executions
            .values()
            .filter(move |step| step.job_execution_id == job_execution_id)
    }

    fn steps_of_instance<'s>(
        &'s self,
        instance_id: u64,
        step_name: &'s str,
    ) -> impl DoubleEndedIterator<Item = &'s StepExecution> {
        self.step_executions.values().filter(move |step| {
            step.step_name == step_name
                && self
                    .job_executions
                    .get(&step.job_execution_id)
                    .is_some_and(|job| job.job_instance.id == instance_id)
        })
    }

    fn last_activity(&self, execution: &JobExecution) -> Option<DateTime<Utc>> {
        self.steps_of(execution.id)
            .filter_map(|step| step.last_updated)
            .chain(execution.last_updated)
            .max()
    }

    fn recover_stale(&mut self, job_execution_id: u64) {
        let now = Utc::now();
        for step in self.step_executions.values_mut() {
            if step.job_execution_id == job_execution_id && stale_failure(&mut step.status) {
                step.exit_status = ExitStatus::failed().with_description(STALE_DESCRIPTION);
                step.end_time = Some(now);
                step.last_updated = Some(now);
                step.version += 1;
            }
        }
        if let Some(job) = self.job_executions.get_mut(&job_execution_id) {
            if stale_failure(&mut job.status) {
                job.exit_status = ExitStatus::failed().with_description(STALE_DESCRIPTION);
                job.end_time = Some(now);
                job.last_updated = Some(now);
                job.version += 1;
            }
        }
    }
}

/// Job repository keeping every record in process memory.
///
/// Identity sequences live in the repository instance itself, so separate
/// repositories never share ids.
#[derive(Default)]
pub struct InMemoryJobRepository {
    state: Mutex<RepositoryState>,
    stale_timeout: Option<Duration>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Running executions without any update for `timeout` may be taken over
    /// by a new launch of the same instance.
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = Some(timeout);
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, RepositoryState>, BatchError> {
        self.state
            .lock()
            .map_err(|_| BatchError::Repository("repository lock poisoned".to_string()))
    }
}

fn unknown(entity: &str, id: u64) -> BatchError {
    BatchError::Repository(format!("{} {} does not exist", entity, id))
}

impl JobRepository for InMemoryJobRepository {
    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, BatchError> {
        let state = self.state()?;
        Ok(state.find_instance(job_name, &parameters.to_key()).cloned())
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, BatchError> {
        let last_id = {
            let state = self.state()?;
            state
                .find_instance(job_name, &parameters.to_key())
                .and_then(|instance| state.last_job_execution(instance.id))
                .map(|execution| execution.id)
        };
        match last_id {
            Some(id) => self.get_job_execution(id),
            None => Ok(None),
        }
    }

    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError> {
        let mut state = self.state()?;
        let job_key = parameters.to_key();

        let instance = match state.find_instance(job_name, &job_key) {
            Some(instance) => instance.clone(),
            None => {
                state.next_instance_id += 1;
                let instance = JobInstance {
                    id: state.next_instance_id,
                    job_name: job_name.to_string(),
                    job_key,
                };
                state.instances.push(instance.clone());
                instance
            }
        };

        let mut context = ExecutionContext::new();
        if let Some(last) = state.last_job_execution(instance.id).cloned() {
            let activity = state.last_activity(&last);
            if check_restart(&last, activity, self.stale_timeout)? == RestartCheck::RecoverStale {
                state.recover_stale(last.id);
            }
            context = last.execution_context;
        }
        context.clear_dirty();

        state.next_job_execution_id += 1;
        let mut execution =
            JobExecution::new(state.next_job_execution_id, instance, parameters.clone());
        execution.execution_context = context;
        execution.last_updated = Some(Utc::now());
        state.job_executions.insert(execution.id, execution.clone());

        debug!("Created job execution {}", execution.id);
        Ok(execution)
    }

    fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError> {
        let mut state = self.state()?;
        let stored = state
            .job_executions
            .get_mut(&job_execution.id)
            .ok_or_else(|| unknown("JobExecution", job_execution.id))?;
        check_version(
            "JobExecution",
            job_execution.id,
            job_execution.version,
            stored.version,
        )?;

        job_execution.version += 1;
        job_execution.last_updated = Some(Utc::now());
        job_execution.execution_context.clear_dirty();

        let mut record = job_execution.clone();
        record.step_executions.clear();
        *stored = record;
        Ok(())
    }

    fn update_job_execution_context(
        &self,
        job_execution: &mut JobExecution,
    ) -> Result<(), BatchError> {
        let mut state = self.state()?;
        let stored = state
            .job_executions
            .get_mut(&job_execution.id)
            .ok_or_else(|| unknown("JobExecution", job_execution.id))?;
        check_version(
            "JobExecution",
            job_execution.id,
            job_execution.version,
            stored.version,
        )?;

        if job_execution.execution_context.is_dirty() {
            job_execution.execution_context.clear_dirty();
            stored.execution_context = job_execution.execution_context.clone();
        }
        Ok(())
    }

    fn get_job_execution(&self, id: u64) -> Result<Option<JobExecution>, BatchError> {
        let state = self.state()?;
        Ok(state.job_executions.get(&id).map(|execution| {
            let mut execution = execution.clone();
            execution.step_executions = state.steps_of(id).cloned().collect();
            execution
        }))
    }

    fn create_step_execution(
        &self,
        job_execution: &JobExecution,
        step_name: &str,
        mut context: ExecutionContext,
        resumed_from: Option<u64>,
    ) -> Result<StepExecution, BatchError> {
        let mut state = self.state()?;
        if !state.job_executions.contains_key(&job_execution.id) {
            return Err(unknown("JobExecution", job_execution.id));
        }

        state.next_step_execution_id += 1;
        let mut step = StepExecution::new(state.next_step_execution_id, job_execution.id, step_name);
        context.clear_dirty();
        step.execution_context = context;
        step.resumed_from = resumed_from;
        step.last_updated = Some(Utc::now());
        step.set_stop_signal(job_execution.stop_signal.clone());

        state.step_executions.insert(step.id, step.clone());
        Ok(step)
    }

    fn update_step_execution(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<(), BatchError> {
        let mut state = self.state()?;
        let stored = state
            .step_executions
            .get_mut(&step_execution.id)
            .ok_or_else(|| unknown("StepExecution", step_execution.id))?;
        check_version(
            "StepExecution",
            step_execution.id,
            step_execution.version,
            stored.version,
        )?;

        step_execution.version += 1;
        step_execution.last_updated = Some(Utc::now());
        step_execution.execution_context.clear_dirty();
        *stored = step_execution.clone();
        Ok(())
    }

    fn update_step_execution_context(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<(), BatchError> {
        let mut state = self.state()?;
        let stored = state
            .step_executions
            .get_mut(&step_execution.id)
            .ok_or_else(|| unknown("StepExecution", step_execution.id))?;
        check_version(
            "StepExecution",
            step_execution.id,
            step_execution.version,
            stored.version,
        )?;

        if step_execution.execution_context.is_dirty() {
            step_execution.execution_context.clear_dirty();
            stored.execution_context = step_execution.execution_context.clone();
        }
        Ok(())
    }

    fn get_last_step_execution(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, BatchError> {
        let state = self.state()?;
        Ok(state
            .steps_of_instance(job_instance.id, step_name)
            .next_back()
            .cloned())
    }

    fn get_step_execution_count(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, BatchError> {
        let state = self.state()?;
        Ok(state.steps_of_instance(job_instance.id, step_name).count())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::execution::BatchStatus;

    use super::*;

    fn parameters() -> JobParameters {
        JobParameters::new().with_string("file", "cars.csv")
    }

    #[test]
    fn same_parameters_share_instance() -> Result<(), BatchError> {
        let repository = InMemoryJobRepository::new();
        let mut first = repository.create_job_execution("import", &parameters())?;
        first.status = BatchStatus::Failed;
        repository.update_job_execution(&mut first)?;

        let second = repository.create_job_execution("import", &parameters())?;
        assert_eq!(first.job_instance, second.job_instance);
        assert_ne!(first.id, second.id);

        let other = repository.create_job_execution("import", &JobParameters::new())?;
        assert_ne!(other.job_instance.id, first.job_instance.id);
        Ok(())
    }

    #[test]
    fn stale_version_is_rejected() -> Result<(), BatchError> {
        let repository = InMemoryJobRepository::new();
        let job = repository.create_job_execution("import", &parameters())?;
        let mut step = repository.create_step_execution(&job, "load", ExecutionContext::new(), None)?;
        let mut stale = step.clone();

        step.read_count = 5;
        repository.update_step_execution(&mut step)?;
        assert_eq!(step.version, 1);

        stale.read_count = 3;
        let result = repository.update_step_execution(&mut stale);
        assert!(matches!(
            result,
            Err(BatchError::OptimisticLock {
                entity: "StepExecution",
                expected: 0,
                found: 1,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn job_context_is_carried_forward() -> Result<(), BatchError> {
        let repository = InMemoryJobRepository::new();
        let mut first = repository.create_job_execution("import", &parameters())?;
        first.execution_context.put("cursor", 42_i64);
        repository.update_job_execution_context(&mut first)?;
        first.status = BatchStatus::Failed;
        repository.update_job_execution(&mut first)?;

        let second = repository.create_job_execution("import", &parameters())?;
        assert_eq!(second.execution_context.get_long("cursor"), Some(42));
        assert!(!second.execution_context.is_dirty());
        Ok(())
    }

    #[test]
    fn last_step_execution_spans_job_executions() -> Result<(), BatchError> {
        let repository = InMemoryJobRepository::new();
        let mut first = repository.create_job_execution("import", &parameters())?;
        repository.create_step_execution(&first, "load", ExecutionContext::new(), None)?;
        first.status = BatchStatus::Failed;
        repository.update_job_execution(&mut first)?;

        let second = repository.create_job_execution("import", &parameters())?;
        let resumed = repository.create_step_execution(&second, "load", ExecutionContext::new(), Some(1))?;

        let last = repository.get_last_step_execution(&second.job_instance, "load")?;
        assert_eq!(last.map(|step| step.id), Some(resumed.id));
        assert_eq!(repository.get_step_execution_count(&second.job_instance, "load")?, 2);
        assert_eq!(repository.get_step_execution_count(&second.job_instance, "other")?, 0);
        Ok(())
    }

    #[test]
    fn stale_running_execution_is_recovered() -> Result<(), BatchError> {
        let repository = InMemoryJobRepository::new().with_stale_timeout(Duration::ZERO);
        let mut first = repository.create_job_execution("import", &parameters())?;
        first.status = BatchStatus::Started;
        repository.update_job_execution(&mut first)?;
        let mut step = repository.create_step_execution(&first, "load", ExecutionContext::new(), None)?;
        step.status = BatchStatus::Started;
        repository.update_step_execution(&mut step)?;

        repository.create_job_execution("import", &parameters())?;

        let recovered = repository
            .get_job_execution(first.id)?
            .ok_or_else(|| unknown("JobExecution", first.id))?;
        assert_eq!(recovered.status, BatchStatus::Failed);
        assert_eq!(recovered.exit_status.exit_description, STALE_DESCRIPTION);
        assert_eq!(recovered.step_executions[0].status, BatchStatus::Failed);
        Ok(())
    }

    #[test]
    fn running_execution_blocks_second_launch() -> Result<(), BatchError> {
        let repository = InMemoryJobRepository::new();
        let mut first = repository.create_job_execution("import", &parameters())?;
        first.status = BatchStatus::Started;
        repository.update_job_execution(&mut first)?;

        let result = repository.create_job_execution("import", &parameters());
        assert!(matches!(result, Err(BatchError::JobExecutionAlreadyRunning(_))));
        Ok(())
    }
}
