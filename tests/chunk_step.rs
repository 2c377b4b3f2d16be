mod common;

use anyhow::Result;

use common::{
    BufferedResource, DirectSink, ScriptedProcessor, ScriptedReader, init_logger,
    mocks::{MockSkipRecorder, MockWriter},
};
use spring_batch_engine::{
    BatchError,
    core::{
        execution::{BatchStatus, JobExecution, JobParameters, StepExecution},
        item::PassThroughProcessor,
        job::{Job, JobBuilder},
        retry::BackOff,
        step::{Step, StepBuilder},
    },
    item::list::ListItemReader,
    repository::{InMemoryJobRepository, JobRepository},
};

fn run(step: &dyn Step) -> JobExecution {
    let repository = InMemoryJobRepository::new();
    let job = JobBuilder::new().name("chunks".to_string()).start(step).build();
    match job.run(&repository, &JobParameters::new()) {
        Ok(execution) => execution,
        Err(BatchError::JobFailed { execution, .. }) => *execution,
        Err(error) => panic!("launch refused: {}", error),
    }
}

fn only_step(execution: &JobExecution) -> &StepExecution {
    assert_eq!(execution.step_executions.len(), 1);
    &execution.step_executions[0]
}

#[test]
fn every_item_is_accounted_for() -> Result<()> {
    init_logger();

    let mut script: Vec<Result<u32, &'static str>> = (1..=20).map(Ok).collect();
    script.insert(4, Err("parse.BadLine"));
    script.insert(12, Err("parse.BadLine"));
    let offered = script.len();

    let reader = ScriptedReader::new(script);
    let processor = ScriptedProcessor::new()
        .filtering_multiples_of(5)
        .failing(7, "parse.BadValue", usize::MAX);
    let resource = BufferedResource::poisoned(|item: &u32| *item == 13);

    let mut skips = MockSkipRecorder::new();
    skips
        .expect_on_skip_in_read()
        .times(2)
        .returning(|_| Ok(()));
    skips
        .expect_on_skip_in_process()
        .withf(|item, _| *item == 7)
        .times(1)
        .returning(|_, _| Ok(()));
    skips
        .expect_on_skip_in_write()
        .withf(|item, _| *item == 13)
        .times(1)
        .returning(|_, _| Ok(()));

    let step = StepBuilder::new()
        .name("accounting".to_string())
        .reader(&reader)
        .processor(&processor)
        .writer(&resource)
        .transaction_manager(&resource)
        .chunk(4)
        .skip("parse.*")
        .skip("db.Constraint")
        .skip_limit(10)
        .skip_listener(&skips)
        .build()?;

    let execution = run(&step);
    let step_execution = only_step(&execution);

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(step_execution.read_count, 20);
    assert_eq!(step_execution.read_skip_count, 2);
    assert_eq!(step_execution.filter_count, 4);
    assert_eq!(step_execution.process_skip_count, 1);
    assert_eq!(step_execution.write_skip_count, 1);
    assert_eq!(step_execution.write_count, 14);

    assert_eq!(
        step_execution.read_count + step_execution.read_skip_count,
        offered
    );
    assert_eq!(
        step_execution.write_count
            + step_execution.filter_count
            + step_execution.process_skip_count
            + step_execution.write_skip_count,
        step_execution.read_count
    );
    assert_eq!(resource.committed().len(), step_execution.write_count);
    assert!(!resource.committed().contains(&13));
    Ok(())
}

#[test]
fn transient_processing_error_is_retried_then_skipped() -> Result<()> {
    let reader = ScriptedReader::items(1..=5);
    let processor = ScriptedProcessor::new().failing(3, "net.Timeout", usize::MAX);
    let resource = BufferedResource::<u32>::new();

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&processor)
        .writer(&resource)
        .transaction_manager(&resource)
        .chunk(5)
        .retry("net.*")
        .retry_limit(2)
        .skip("net.*")
        .skip_limit(1)
        .build()?;

    let execution = run(&step);
    let step_execution = only_step(&execution);

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(processor.attempts(3), 3);
    assert_eq!(step_execution.process_skip_count, 1);
    assert_eq!(resource.committed(), vec![1, 2, 4, 5]);
    Ok(())
}

#[test]
fn retry_recovers_without_skipping() -> Result<()> {
    let reader = ScriptedReader::items(1..=5);
    let processor = ScriptedProcessor::new().failing(3, "net.Timeout", 2);
    let resource = BufferedResource::<u32>::new();

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&processor)
        .writer(&resource)
        .transaction_manager(&resource)
        .retry("net.*")
        .retry_limit(2)
        .build()?;

    let execution = run(&step);

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(processor.attempts(3), 3);
    assert_eq!(only_step(&execution).skip_count(), 0);
    assert_eq!(resource.committed(), vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn skip_limit_is_inclusive() -> Result<()> {
    let reader = ScriptedReader::items(1..=6);
    let processor = ScriptedProcessor::new()
        .failing(2, "parse.Bad", usize::MAX)
        .failing(4, "parse.Bad", usize::MAX);
    let resource = BufferedResource::<u32>::new();

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&processor)
        .writer(&resource)
        .transaction_manager(&resource)
        .skip("parse.*")
        .skip_limit(2)
        .build()?;

    let execution = run(&step);

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(only_step(&execution).process_skip_count, 2);
    assert_eq!(resource.committed(), vec![1, 3, 5, 6]);
    Ok(())
}

#[test]
fn one_skip_too_many_fails_the_step() -> Result<()> {
    let reader = ScriptedReader::items(1..=6);
    let processor = ScriptedProcessor::new()
        .failing(2, "parse.Bad", usize::MAX)
        .failing(4, "parse.Bad", usize::MAX)
        .failing(6, "parse.Bad", usize::MAX);
    let resource = BufferedResource::<u32>::new();

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&processor)
        .writer(&resource)
        .transaction_manager(&resource)
        .skip("parse.*")
        .skip_limit(2)
        .build()?;

    let execution = run(&step);
    let step_execution = only_step(&execution);

    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(step_execution.status, BatchStatus::Failed);
    assert!(step_execution.failure_exceptions[0].starts_with("Skip limit exceeded"));
    assert_eq!(step_execution.rollback_count, 1);
    assert_eq!(step_execution.skip_count(), 0);
    assert!(resource.committed().is_empty());
    Ok(())
}

#[test]
fn scan_skips_only_the_failing_items() -> Result<()> {
    let reader = ScriptedReader::items(1..=10);
    let resource = BufferedResource::poisoned(|item: &u32| *item == 3 || *item == 8);

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&PassThroughProcessor)
        .writer(&resource)
        .transaction_manager(&resource)
        .chunk(5)
        .skip("db.Constraint")
        .skip_limit(2)
        .build()?;

    let execution = run(&step);
    let step_execution = only_step(&execution);

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(step_execution.write_skip_count, 2);
    assert_eq!(step_execution.write_count, 8);
    assert_eq!(resource.committed(), vec![1, 2, 4, 5, 6, 7, 9, 10]);
    // the final empty chunk is committed as well
    assert_eq!(step_execution.commit_count, 3);
    assert_eq!(step_execution.rollback_count, 0);
    // one batch rollback and one single item rollback per poisoned chunk
    assert_eq!(resource.rollbacks(), 4);
    Ok(())
}

#[test]
fn scan_without_transaction_writes_cleared_items_once() -> Result<()> {
    let reader = ScriptedReader::items(1..=5);
    let sink = DirectSink::rejecting(3);

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&PassThroughProcessor)
        .writer(&sink)
        .chunk(5)
        .skip("db.Constraint")
        .skip_limit(1)
        .build()?;

    let execution = run(&step);
    let step_execution = only_step(&execution);

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(step_execution.write_count, 4);
    assert_eq!(step_execution.write_skip_count, 1);
    assert_eq!(sink.items(), vec![1, 2, 4, 5]);
    Ok(())
}

fn read_with_retries(script: Vec<Result<u32, &'static str>>) -> Result<(JobExecution, Vec<u32>)> {
    let reader = ScriptedReader::new(script);
    let resource = BufferedResource::<u32>::new();

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&PassThroughProcessor)
        .writer(&resource)
        .transaction_manager(&resource)
        .retry("net.*")
        .retry_limit(2)
        .skip("net.*")
        .skip_limit(1)
        .build()?;

    let execution = run(&step);
    Ok((execution, resource.committed()))
}

#[test]
fn read_recovering_within_retry_limit_is_not_skipped() -> Result<()> {
    let (execution, committed) = read_with_retries(vec![
        Ok(1),
        Err("net.Timeout"),
        Err("net.Timeout"),
        Ok(2),
        Ok(3),
    ])?;
    let step_execution = only_step(&execution);

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(step_execution.read_skip_count, 0);
    assert_eq!(step_execution.read_count, 3);
    assert_eq!(committed, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn read_failing_past_retry_limit_is_skipped_once() -> Result<()> {
    let (execution, committed) = read_with_retries(vec![
        Ok(1),
        Err("net.Timeout"),
        Err("net.Timeout"),
        Err("net.Timeout"),
        Ok(2),
    ])?;
    let step_execution = only_step(&execution);

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(step_execution.read_skip_count, 1);
    assert_eq!(step_execution.read_count, 2);
    assert_eq!(committed, vec![1, 2]);
    Ok(())
}

#[test]
fn write_failure_without_scan_fails_with_raw_error() -> Result<()> {
    let reader = ScriptedReader::items(1..=3);
    let mut writer = MockWriter::new();
    writer.expect_open().times(1).returning(|_| Ok(()));
    writer
        .expect_write()
        .times(1)
        .returning(|_| Err(BatchError::writer("db.Constraint", "duplicate key")));
    writer.expect_flush().never();
    writer.expect_update().never();
    writer.expect_close().times(1).returning(|| Ok(()));

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&PassThroughProcessor)
        .writer(&writer)
        .skip("db.*")
        .skip_limit(5)
        .scan_on_write_failure(false)
        .build()?;

    let execution = run(&step);
    let step_execution = only_step(&execution);

    assert_eq!(step_execution.status, BatchStatus::Failed);
    assert!(step_execution.failure_exceptions[0].contains("db.Constraint"));
    assert_eq!(step_execution.write_skip_count, 0);
    assert_eq!(step_execution.rollback_count, 1);
    Ok(())
}

#[test]
fn exhausted_write_retries_without_scan_report_attempts() -> Result<()> {
    let reader = ScriptedReader::items(1..=3);
    let resource = BufferedResource::<u32>::new().with_transient_failures(5);

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&PassThroughProcessor)
        .writer(&resource)
        .transaction_manager(&resource)
        .retry("db.Deadlock")
        .retry_limit(2)
        .scan_on_write_failure(false)
        .build()?;

    let execution = run(&step);
    let step_execution = only_step(&execution);

    assert_eq!(step_execution.status, BatchStatus::Failed);
    assert!(step_execution.failure_exceptions[0].starts_with("Retry exhausted after 3 attempts"));
    assert_eq!(resource.write_calls(), 3);
    assert!(resource.committed().is_empty());
    Ok(())
}

#[test]
fn write_is_retried_with_back_off() -> Result<()> {
    let reader = ScriptedReader::items(1..=4);
    let resource = BufferedResource::<u32>::new().with_transient_failures(2);

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&PassThroughProcessor)
        .writer(&resource)
        .transaction_manager(&resource)
        .chunk(4)
        .retry("db.Deadlock")
        .retry_limit(3)
        .backoff(BackOff::Fixed { delay_ms: 1 })
        .build()?;

    let execution = run(&step);

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(resource.committed(), vec![1, 2, 3, 4]);
    assert_eq!(resource.write_calls(), 3);
    Ok(())
}

#[test]
fn fatal_error_rolls_back_only_the_current_chunk() -> Result<()> {
    let reader = ScriptedReader::items(1..=12);
    let processor = ScriptedProcessor::new().failing(8, "fatal.Corrupt", usize::MAX);
    let resource = BufferedResource::<u32>::new();

    let step = StepBuilder::new()
        .reader(&reader)
        .processor(&processor)
        .writer(&resource)
        .transaction_manager(&resource)
        .chunk(5)
        .build()?;

    let execution = run(&step);
    let step_execution = only_step(&execution);

    assert_eq!(step_execution.status, BatchStatus::Failed);
    assert_eq!(step_execution.commit_count, 1);
    assert_eq!(step_execution.rollback_count, 1);
    assert_eq!(step_execution.read_count, 5);
    assert_eq!(step_execution.write_count, 5);
    assert_eq!(resource.committed(), vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn failed_commit_restores_previous_chunk_state() -> Result<()> {
    let repository = InMemoryJobRepository::new();
    let reader = ListItemReader::new("numbers", (1..=6).collect::<Vec<u32>>());
    let resource = BufferedResource::<u32>::new().with_failing_commit(2);

    let step = StepBuilder::new()
        .name("load".to_string())
        .reader(&reader)
        .processor(&PassThroughProcessor)
        .writer(&resource)
        .transaction_manager(&resource)
        .chunk(2)
        .build()?;
    let job = JobBuilder::new().name("load".to_string()).start(&step).build();

    let first = match job.run(&repository, &JobParameters::new()) {
        Err(BatchError::JobFailed { execution, .. }) => *execution,
        other => panic!("expected failure, got {:?}", other.map(|execution| execution.status)),
    };
    let failed = only_step(&first);
    assert_eq!(failed.status, BatchStatus::Failed);
    assert_eq!(failed.read_count, 2);
    assert_eq!(failed.write_count, 2);
    assert_eq!(failed.commit_count, 1);
    assert_eq!(failed.rollback_count, 1);
    assert_eq!(resource.committed(), vec![1, 2]);

    let stored = repository
        .get_job_execution(first.id)?
        .ok_or_else(|| anyhow::anyhow!("execution not stored"))?;
    let stored_step = only_step(&stored);
    assert_eq!(stored_step.read_count, 2);
    assert_eq!(
        stored_step.execution_context.get_long("numbers.read.count"),
        Some(2)
    );

    let second = job.run(&repository, &JobParameters::new())?;
    let resumed = only_step(&second);
    assert_eq!(second.status, BatchStatus::Completed);
    assert_eq!(resumed.resumed_from, Some(failed.id));
    assert_eq!(resumed.read_count, 4);
    assert_eq!(resource.committed(), vec![1, 2, 3, 4, 5, 6]);
    Ok(())
}
