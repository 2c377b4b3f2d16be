use chrono::Utc;
use log::{debug, error, info, warn};

use crate::{BatchError, repository::JobRepository};

use super::{
    build_name,
    chunk::{ChunkProcessor, ChunkResult},
    context::ExecutionContext,
    execution::{BatchStatus, ExitStatus, StepExecution},
    item::{ItemProcessor, ItemReader, ItemWriter},
    listener::{
        ChunkListener, ItemProcessListener, ItemReadListener, ItemWriteListener, SkipListener,
        StepListener, StepListeners,
    },
    retry::{BackOff, RetryPolicy},
    settings::FaultToleranceSettings,
    skip::SkipPolicy,
    transaction::{ChunkTransaction, ResourcelessTransactionManager, TransactionManager},
};

/// A phase of a job, executed against a step execution created by the job.
pub trait Step {
    fn get_name(&self) -> &str;

    /// Runs the step and records its outcome in `step_execution`.
    ///
    /// Returns `Ok` when the step ends `COMPLETED` or `STOPPED`.
    fn execute(
        &self,
        step_execution: &mut StepExecution,
        repository: &dyn JobRepository,
    ) -> Result<(), BatchError>;

    /// Whether a step already completed by a previous run executes again on restart.
    fn allow_start_if_complete(&self) -> bool {
        false
    }

    /// Maximum number of executions of this step within one job instance.
    fn start_limit(&self) -> usize {
        usize::MAX
    }
}

/// Step reading, processing and writing items chunk by chunk.
///
/// Every chunk runs inside its own transaction. Counters, stream state and
/// the step execution record are committed together with the chunk, so a
/// restart resumes right after the last committed chunk.
pub struct ChunkOrientedStep<'a, I, O> {
    name: String,
    reader: &'a dyn ItemReader<I>,
    processor: &'a dyn ItemProcessor<I, O>,
    writer: &'a dyn ItemWriter<O>,
    retry_policy: Box<dyn RetryPolicy + 'a>,
    skip_policy: Box<dyn SkipPolicy + 'a>,
    transaction_manager: &'a dyn TransactionManager,
    listeners: StepListeners<'a, I, O>,
    chunk_size: usize,
    scan_on_write_failure: bool,
    allow_start_if_complete: bool,
    start_limit: usize,
}

impl<I, O> Step for ChunkOrientedStep<'_, I, O> {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        step_execution: &mut StepExecution,
        repository: &dyn JobRepository,
    ) -> Result<(), BatchError> {
        info!("Start of step: {}, id: {}", self.name, step_execution.id);

        step_execution.start_time = Some(Utc::now());
        step_execution.status = BatchStatus::Started;
        repository.update_step_execution(step_execution)?;

        let outcome = self.run(step_execution, repository);
        self.close_streams();

        match outcome {
            Ok(()) if step_execution.status == BatchStatus::Stopped => {}
            Ok(()) => step_execution.status = BatchStatus::Completed,
            Err(error) => {
                error!("Step {} failed: {}", self.name, error);
                step_execution.add_failure(&error);
                if step_execution.status != BatchStatus::Unknown {
                    step_execution.status = BatchStatus::Failed;
                }
            }
        }

        if let Err(error) = self.listeners.after_step(step_execution) {
            error!("after_step listener of {} failed: {}", self.name, error);
            step_execution.add_failure(&error);
            step_execution.status = BatchStatus::Failed;
        }

        step_execution.end_time = Some(Utc::now());
        step_execution.exit_status = exit_status(step_execution);

        if let Err(error) = repository.update_step_execution(step_execution) {
            error!("Unable to persist end of step {}: {}", self.name, error);
            step_execution.status = BatchStatus::Unknown;
            step_execution.exit_status = ExitStatus::unknown();
            return Err(error);
        }

        info!(
            "End of step: {}, id: {}, status: {}",
            self.name, step_execution.id, step_execution.status
        );

        match step_execution.status {
            BatchStatus::Completed | BatchStatus::Stopped => Ok(()),
            _ => Err(BatchError::Step(self.name.clone())),
        }
    }

    fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }

    fn start_limit(&self) -> usize {
        self.start_limit
    }
}

impl<I, O> ChunkOrientedStep<'_, I, O> {
    fn run(
        &self,
        step_execution: &mut StepExecution,
        repository: &dyn JobRepository,
    ) -> Result<(), BatchError> {
        self.listeners.before_step(step_execution)?;
        self.open_streams(&step_execution.execution_context)?;
        self.process_chunks(step_execution, repository)
    }

    fn process_chunks(
        &self,
        step_execution: &mut StepExecution,
        repository: &dyn JobRepository,
    ) -> Result<(), BatchError> {
        let chunk_processor = ChunkProcessor {
            reader: self.reader,
            processor: self.processor,
            writer: self.writer,
            retry_policy: self.retry_policy.as_ref(),
            skip_policy: self.skip_policy.as_ref(),
            listeners: &self.listeners,
            chunk_size: self.chunk_size,
            scan_on_write_failure: self.scan_on_write_failure,
        };

        loop {
            if step_execution.is_stop_requested() {
                info!("Stop requested, ending step {} before next chunk", self.name);
                step_execution.status = BatchStatus::Stopped;
                return Ok(());
            }

            let mut transaction = ChunkTransaction::begin(self.transaction_manager)?;

            if let Err(error) = self.listeners.before_chunk(step_execution) {
                return Err(self.rollback_chunk(step_execution, transaction, error));
            }

            let result =
                match chunk_processor.process_chunk(step_execution.skip_count(), &mut transaction) {
                    Ok(result) => result,
                    Err(error) => return Err(self.rollback_chunk(step_execution, transaction, error)),
                };

            self.commit_chunk(step_execution, repository, transaction, &result)?;
            self.listeners.after_chunk(step_execution)?;

            debug!(
                "Chunk {} committed: {} written, {} skipped",
                step_execution.commit_count,
                result.written(),
                result.skipped()
            );

            if result.is_finished() {
                return Ok(());
            }
        }
    }

    /// Commit sequence of one chunk: counters, stream state, repository
    /// record, then the resource transaction.
    fn commit_chunk(
        &self,
        step_execution: &mut StepExecution,
        repository: &dyn JobRepository,
        transaction: ChunkTransaction<'_>,
        result: &ChunkResult,
    ) -> Result<(), BatchError> {
        let snapshot = step_execution.clone();

        step_execution.apply(&result.contribution);
        step_execution.commit_count += 1;

        if let Err(error) = self.update_streams(&mut step_execution.execution_context) {
            *step_execution = snapshot;
            return Err(self.rollback_chunk(step_execution, transaction, error));
        }

        if let Err(error) = repository.update_step_execution(step_execution) {
            *step_execution = snapshot;
            let error = self.rollback_chunk(step_execution, transaction, error);
            step_execution.status = BatchStatus::Unknown;
            return Err(error);
        }

        if let Err(error) = transaction.commit() {
            error!("Commit of chunk failed in step {}: {}", self.name, error);
            // The repository already holds this chunk, put the previous state back
            let version = step_execution.version;
            *step_execution = snapshot;
            step_execution.version = version;
            step_execution.rollback_count += 1;
            step_execution.execution_context.mark_dirty();
            if let Err(restore_error) = repository.update_step_execution(step_execution) {
                error!(
                    "Unable to restore step {} after failed commit: {}",
                    self.name, restore_error
                );
                step_execution.status = BatchStatus::Unknown;
            }
            self.listeners.after_chunk_error(step_execution, &error);
            return Err(error);
        }

        Ok(())
    }

    fn rollback_chunk(
        &self,
        step_execution: &mut StepExecution,
        transaction: ChunkTransaction<'_>,
        error: BatchError,
    ) -> BatchError {
        warn!("Rolling back chunk of step {}: {}", self.name, error);
        if let Err(rollback_error) = transaction.rollback() {
            error!("Rollback failed in step {}: {}", self.name, rollback_error);
        }
        step_execution.rollback_count += 1;
        self.listeners.after_chunk_error(step_execution, &error);
        error
    }

    fn open_streams(&self, context: &ExecutionContext) -> Result<(), BatchError> {
        self.reader.open(context)?;
        self.writer.open(context)
    }

    fn update_streams(&self, context: &mut ExecutionContext) -> Result<(), BatchError> {
        self.reader.update(context)?;
        self.writer.update(context)
    }

    fn close_streams(&self) {
        if let Err(error) = self.reader.close() {
            warn!("Unable to close reader of step {}: {}", self.name, error);
        }
        if let Err(error) = self.writer.close() {
            warn!("Unable to close writer of step {}: {}", self.name, error);
        }
    }
}

fn exit_status(step_execution: &StepExecution) -> ExitStatus {
    let exit_status = ExitStatus::for_status(step_execution.status);
    if step_execution.failure_exceptions.is_empty() {
        exit_status
    } else {
        exit_status.with_description(step_execution.failure_exceptions.join("; "))
    }
}

/// Builder of [`ChunkOrientedStep`].
///
/// Fault tolerance is configured either field by field or at once through
/// [`FaultToleranceSettings`]. Explicit policies given with
/// [`retry_policy`](StepBuilder::retry_policy) and
/// [`skip_policy`](StepBuilder::skip_policy) take precedence over the
/// settings.
///
/// ```
/// use spring_batch_engine::core::{
///     item::PassThroughProcessor,
///     step::{Step, StepBuilder},
/// };
/// use spring_batch_engine::item::list::{ListItemReader, ListItemWriter};
///
/// let reader = ListItemReader::new("numbers", vec![1, 2, 3]);
/// let writer = ListItemWriter::<i32>::new();
///
/// let step = StepBuilder::new()
///     .name("copy".to_string())
///     .reader(&reader)
///     .processor(&PassThroughProcessor)
///     .writer(&writer)
///     .chunk(2)
///     .skip("parse.*")
///     .skip_limit(5)
///     .build()
///     .unwrap();
///
/// assert_eq!(step.get_name(), "copy");
/// ```
pub struct StepBuilder<'a, I, O> {
    name: Option<String>,
    reader: Option<&'a dyn ItemReader<I>>,
    processor: Option<&'a dyn ItemProcessor<I, O>>,
    writer: Option<&'a dyn ItemWriter<O>>,
    settings: FaultToleranceSettings,
    retry_policy: Option<Box<dyn RetryPolicy + 'a>>,
    skip_policy: Option<Box<dyn SkipPolicy + 'a>>,
    transaction_manager: &'a dyn TransactionManager,
    listeners: StepListeners<'a, I, O>,
    allow_start_if_complete: bool,
    start_limit: usize,
}

impl<I, O> Default for StepBuilder<'_, I, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, I, O> StepBuilder<'a, I, O> {
    pub fn new() -> StepBuilder<'a, I, O> {
        Self {
            name: None,
            reader: None,
            processor: None,
            writer: None,
            settings: FaultToleranceSettings::default(),
            retry_policy: None,
            skip_policy: None,
            transaction_manager: &ResourcelessTransactionManager,
            listeners: StepListeners::default(),
            allow_start_if_complete: false,
            start_limit: usize::MAX,
        }
    }

    pub fn name(mut self, name: String) -> StepBuilder<'a, I, O> {
        self.name = Some(name);
        self
    }

    pub fn reader(mut self, reader: &'a dyn ItemReader<I>) -> StepBuilder<'a, I, O> {
        self.reader = Some(reader);
        self
    }

    pub fn processor(mut self, processor: &'a dyn ItemProcessor<I, O>) -> StepBuilder<'a, I, O> {
        self.processor = Some(processor);
        self
    }

    pub fn writer(mut self, writer: &'a dyn ItemWriter<O>) -> StepBuilder<'a, I, O> {
        self.writer = Some(writer);
        self
    }

    pub fn chunk(mut self, chunk_size: usize) -> StepBuilder<'a, I, O> {
        self.settings.chunk_size = chunk_size;
        self
    }

    /// Replaces the whole fault tolerance configuration.
    pub fn settings(mut self, settings: FaultToleranceSettings) -> StepBuilder<'a, I, O> {
        self.settings = settings;
        self
    }

    pub fn skip_limit(mut self, skip_limit: usize) -> StepBuilder<'a, I, O> {
        self.settings.skip_limit = skip_limit;
        self
    }

    /// Adds a skippable error kind pattern.
    pub fn skip(mut self, pattern: &str) -> StepBuilder<'a, I, O> {
        self.settings.skippable.push(pattern.to_string());
        self
    }

    pub fn no_skip(mut self, pattern: &str) -> StepBuilder<'a, I, O> {
        self.settings.non_skippable.push(pattern.to_string());
        self
    }

    pub fn retry_limit(mut self, retry_limit: usize) -> StepBuilder<'a, I, O> {
        self.settings.retry_limit = retry_limit;
        self
    }

    /// Adds a retryable error kind pattern.
    pub fn retry(mut self, pattern: &str) -> StepBuilder<'a, I, O> {
        self.settings.retryable.push(pattern.to_string());
        self
    }

    pub fn no_retry(mut self, pattern: &str) -> StepBuilder<'a, I, O> {
        self.settings.non_retryable.push(pattern.to_string());
        self
    }

    pub fn backoff(mut self, backoff: BackOff) -> StepBuilder<'a, I, O> {
        self.settings.backoff = backoff;
        self
    }

    pub fn scan_on_write_failure(mut self, enabled: bool) -> StepBuilder<'a, I, O> {
        self.settings.scan_on_write_failure = enabled;
        self
    }

    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'a) -> StepBuilder<'a, I, O> {
        self.retry_policy = Some(Box::new(policy));
        self
    }

    pub fn skip_policy(mut self, policy: impl SkipPolicy + 'a) -> StepBuilder<'a, I, O> {
        self.skip_policy = Some(Box::new(policy));
        self
    }

    pub fn transaction_manager(
        mut self,
        transaction_manager: &'a dyn TransactionManager,
    ) -> StepBuilder<'a, I, O> {
        self.transaction_manager = transaction_manager;
        self
    }

    pub fn step_listener(mut self, listener: &'a dyn StepListener) -> StepBuilder<'a, I, O> {
        self.listeners.step.push(listener);
        self
    }

    pub fn chunk_listener(mut self, listener: &'a dyn ChunkListener) -> StepBuilder<'a, I, O> {
        self.listeners.chunk.push(listener);
        self
    }

    pub fn read_listener(mut self, listener: &'a dyn ItemReadListener<I>) -> StepBuilder<'a, I, O> {
        self.listeners.read.push(listener);
        self
    }

    pub fn process_listener(
        mut self,
        listener: &'a dyn ItemProcessListener<I, O>,
    ) -> StepBuilder<'a, I, O> {
        self.listeners.process.push(listener);
        self
    }

    pub fn write_listener(
        mut self,
        listener: &'a dyn ItemWriteListener<O>,
    ) -> StepBuilder<'a, I, O> {
        self.listeners.write.push(listener);
        self
    }

    pub fn skip_listener(mut self, listener: &'a dyn SkipListener<I, O>) -> StepBuilder<'a, I, O> {
        self.listeners.skip.push(listener);
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> StepBuilder<'a, I, O> {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn start_limit(mut self, start_limit: usize) -> StepBuilder<'a, I, O> {
        self.start_limit = start_limit;
        self
    }

    pub fn build(self) -> Result<ChunkOrientedStep<'a, I, O>, BatchError> {
        self.settings.validate()?;

        let missing = |part: &str| BatchError::Configuration(format!("step needs {}", part));
        let reader = self.reader.ok_or_else(|| missing("a reader"))?;
        let processor = self.processor.ok_or_else(|| missing("a processor"))?;
        let writer = self.writer.ok_or_else(|| missing("a writer"))?;

        let settings = self.settings;
        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| Box::new(settings.retry_policy()));
        let skip_policy = self
            .skip_policy
            .unwrap_or_else(|| Box::new(settings.skip_policy()));

        Ok(ChunkOrientedStep {
            name: self.name.unwrap_or_else(build_name),
            reader,
            processor,
            writer,
            retry_policy,
            skip_policy,
            transaction_manager: self.transaction_manager,
            listeners: self.listeners,
            chunk_size: settings.chunk_size,
            scan_on_write_failure: settings.scan_on_write_failure,
            allow_start_if_complete: self.allow_start_if_complete,
            start_limit: self.start_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::{
        core::{
            execution::JobParameters,
            item::{ItemProcessorResult, PassThroughProcessor},
        },
        item::list::{ListItemReader, ListItemWriter},
        repository::InMemoryJobRepository,
    };

    use super::*;

    struct Doubler;

    impl ItemProcessor<u32, u64> for Doubler {
        fn process(&self, item: &u32) -> ItemProcessorResult<u64> {
            Ok(Some(u64::from(*item) * 2))
        }
    }

    fn launch(repository: &InMemoryJobRepository, step: &dyn Step) -> Result<StepExecution> {
        let job = repository.create_job_execution("job", &JobParameters::new())?;
        let mut step_execution = repository.create_step_execution(
            &job,
            step.get_name(),
            ExecutionContext::new(),
            None,
        )?;
        let _ = step.execute(&mut step_execution, repository);
        Ok(step_execution)
    }

    #[test]
    fn build_requires_reader_and_writer() {
        let writer = ListItemWriter::<u32>::new();
        let result = StepBuilder::<u32, u32>::new()
            .processor(&PassThroughProcessor)
            .writer(&writer)
            .build();
        assert!(matches!(result, Err(BatchError::Configuration(_))));
    }

    #[test]
    fn build_rejects_empty_chunk() {
        let reader = ListItemReader::new("numbers", vec![1_u32]);
        let writer = ListItemWriter::<u32>::new();
        let result = StepBuilder::new()
            .reader(&reader)
            .processor(&PassThroughProcessor)
            .writer(&writer)
            .chunk(0)
            .build();
        assert!(matches!(result, Err(BatchError::Configuration(_))));
    }

    #[test]
    fn step_commits_one_chunk_per_batch_plus_final() -> Result<()> {
        let repository = InMemoryJobRepository::new();
        let reader = ListItemReader::new("numbers", (1..=7).collect::<Vec<u32>>());
        let writer = ListItemWriter::<u64>::new();
        let step = StepBuilder::new()
            .name("double".to_string())
            .reader(&reader)
            .processor(&Doubler)
            .writer(&writer)
            .chunk(3)
            .build()?;

        let step_execution = launch(&repository, &step)?;

        assert_eq!(step_execution.status, BatchStatus::Completed);
        assert_eq!(step_execution.exit_status, ExitStatus::completed());
        assert_eq!(step_execution.read_count, 7);
        assert_eq!(step_execution.write_count, 7);
        assert_eq!(step_execution.commit_count, 3);
        assert_eq!(writer.items(), vec![2, 4, 6, 8, 10, 12, 14]);
        assert_eq!(
            step_execution.execution_context.get_long("numbers.read.count"),
            Some(7)
        );
        Ok(())
    }

    #[test]
    fn stop_signal_ends_step_before_next_chunk() -> Result<()> {
        let repository = InMemoryJobRepository::new();
        let reader = ListItemReader::new("numbers", (1..=4).collect::<Vec<u32>>());
        let writer = ListItemWriter::<u32>::new();

        struct StopAfterFirstChunk;
        impl ChunkListener for StopAfterFirstChunk {
            fn after_chunk(&self, step_execution: &StepExecution) -> Result<(), BatchError> {
                step_execution.stop_signal().stop();
                Ok(())
            }
        }

        let step = StepBuilder::new()
            .reader(&reader)
            .processor(&PassThroughProcessor)
            .writer(&writer)
            .chunk(2)
            .chunk_listener(&StopAfterFirstChunk)
            .build()?;

        let step_execution = launch(&repository, &step)?;

        assert_eq!(step_execution.status, BatchStatus::Stopped);
        assert_eq!(step_execution.exit_status.exit_code, ExitStatus::STOPPED);
        assert_eq!(writer.items(), vec![1, 2]);
        assert_eq!(step_execution.commit_count, 1);
        Ok(())
    }

    #[test]
    fn failing_before_step_listener_fails_step() -> Result<()> {
        struct Refuse;
        impl StepListener for Refuse {
            fn before_step(&self, _step_execution: &StepExecution) -> Result<(), BatchError> {
                Err(BatchError::listener("before_step", "not today"))
            }
        }

        let repository = InMemoryJobRepository::new();
        let reader = ListItemReader::new("numbers", vec![1_u32]);
        let writer = ListItemWriter::<u32>::new();
        let step = StepBuilder::new()
            .reader(&reader)
            .processor(&PassThroughProcessor)
            .writer(&writer)
            .step_listener(&Refuse)
            .build()?;

        let step_execution = launch(&repository, &step)?;

        assert_eq!(step_execution.status, BatchStatus::Failed);
        assert!(writer.items().is_empty());
        assert_eq!(step_execution.failure_exceptions.len(), 1);
        Ok(())
    }
}
