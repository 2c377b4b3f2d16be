use std::{slice, thread};

use log::{debug, error, info, warn};

use crate::error::BatchError;

use super::{
    execution::StepContribution,
    item::{ItemProcessor, ItemReader, ItemWriter},
    listener::StepListeners,
    retry::RetryPolicy,
    skip::SkipPolicy,
    transaction::ChunkTransaction,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChunkStatus {
    /// The source may still hold items
    Continuable,
    /// The source signalled the end of data while this chunk was read
    Finished,
}

/// Items of one chunk, bounded by the chunk size.
///
/// A chunk lives for one read/process/write cycle and is never persisted.
pub struct Chunk<I> {
    items: Vec<I>,
    chunk_size: usize,
    status: ChunkStatus,
}

impl<I> Chunk<I> {
    pub fn new(chunk_size: usize) -> Chunk<I> {
        Chunk {
            items: Vec::with_capacity(chunk_size),
            chunk_size,
            status: ChunkStatus::Continuable,
        }
    }

    pub fn add_item(&mut self, item: I) {
        self.items.push(item);
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.chunk_size
    }

    pub fn finish(&mut self) {
        self.status = ChunkStatus::Finished;
    }

    pub fn get_items(&self) -> &[I] {
        &self.items
    }

    pub fn get_status(&self) -> ChunkStatus {
        self.status
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outcome of a chunk that reached the point where it can be committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkResult {
    pub contribution: StepContribution,
    pub status: ChunkStatus,
}

impl ChunkResult {
    pub fn written(&self) -> usize {
        self.contribution.write_count
    }

    pub fn skipped(&self) -> usize {
        self.contribution.skip_count()
    }

    pub fn is_finished(&self) -> bool {
        self.status == ChunkStatus::Finished
    }
}

/// Runs the read/process/write cycle of one chunk.
///
/// Item failures are resolved here through the retry and skip policies. Only
/// fatal failures leave this type, as the `Err` of [`process_chunk`].
///
/// [`process_chunk`]: ChunkProcessor::process_chunk
pub struct ChunkProcessor<'a, I, O> {
    pub(crate) reader: &'a dyn ItemReader<I>,
    pub(crate) processor: &'a dyn ItemProcessor<I, O>,
    pub(crate) writer: &'a dyn ItemWriter<O>,
    pub(crate) retry_policy: &'a dyn RetryPolicy,
    pub(crate) skip_policy: &'a dyn SkipPolicy,
    pub(crate) listeners: &'a StepListeners<'a, I, O>,
    pub(crate) chunk_size: usize,
    pub(crate) scan_on_write_failure: bool,
}

impl<I, O> ChunkProcessor<'_, I, O> {
    /// Processes one chunk inside `transaction`.
    ///
    /// `skips_before` is the number of items the step execution already
    /// skipped in committed chunks; the skip limit applies to the sum.
    pub fn process_chunk(
        &self,
        skips_before: usize,
        transaction: &mut ChunkTransaction<'_>,
    ) -> Result<ChunkResult, BatchError> {
        let mut contribution = StepContribution::default();

        let chunk = self.read_chunk(&mut contribution, skips_before)?;
        let outputs = self.transform_chunk(&chunk, &mut contribution, skips_before)?;
        self.write_chunk(outputs, &mut contribution, skips_before, transaction)?;

        Ok(ChunkResult {
            contribution,
            status: chunk.get_status(),
        })
    }

    fn read_chunk(
        &self,
        contribution: &mut StepContribution,
        skips_before: usize,
    ) -> Result<Chunk<I>, BatchError> {
        debug!("Start reading chunk");
        let mut chunk = Chunk::new(self.chunk_size);

        while !chunk.is_full() {
            match self.read_item(contribution, skips_before)? {
                Some(item) => chunk.add_item(item),
                None => {
                    chunk.finish();
                    break;
                }
            }
        }

        debug!(
            "End reading chunk: {} items, {:?}",
            chunk.len(),
            chunk.get_status()
        );
        Ok(chunk)
    }

    fn read_item(
        &self,
        contribution: &mut StepContribution,
        skips_before: usize,
    ) -> Result<Option<I>, BatchError> {
        let mut attempt = 0;
        loop {
            self.listeners.before_read()?;
            match self.reader.read() {
                Ok(Some(item)) => {
                    self.listeners.after_read(&item)?;
                    contribution.read_count += 1;
                    return Ok(Some(item));
                }
                Ok(None) => return Ok(None),
                Err(error) => {
                    self.listeners.on_read_error(&error);
                    attempt += 1;
                    if self.retry(&error, attempt) {
                        continue;
                    }
                    let error =
                        self.check_skip(error, attempt, skips_before + contribution.skip_count())?;
                    warn!("Skipping item on read: {}", error);
                    self.listeners.on_skip_in_read(&error);
                    contribution.read_skip_count += 1;
                    attempt = 0;
                }
            }
        }
    }

    fn transform_chunk(
        &self,
        chunk: &Chunk<I>,
        contribution: &mut StepContribution,
        skips_before: usize,
    ) -> Result<Vec<O>, BatchError> {
        debug!("Processing chunk of {} items", chunk.len());
        let mut outputs = Vec::with_capacity(chunk.len());

        for item in chunk.get_items() {
            if let Some(output) = self.process_item(item, contribution, skips_before)? {
                outputs.push(output);
            }
        }

        Ok(outputs)
    }

    fn process_item(
        &self,
        item: &I,
        contribution: &mut StepContribution,
        skips_before: usize,
    ) -> Result<Option<O>, BatchError> {
        let mut attempt = 0;
        loop {
            self.listeners.before_process(item)?;
            match self.processor.process(item) {
                Ok(Some(output)) => {
                    self.listeners.after_process(item, Some(&output))?;
                    return Ok(Some(output));
                }
                Ok(None) => {
                    self.listeners.after_process(item, None)?;
                    contribution.filter_count += 1;
                    return Ok(None);
                }
                Err(error) => {
                    self.listeners.on_process_error(item, &error);
                    attempt += 1;
                    if self.retry(&error, attempt) {
                        continue;
                    }
                    let error =
                        self.check_skip(error, attempt, skips_before + contribution.skip_count())?;
                    warn!("Skipping item on process: {}", error);
                    self.listeners.on_skip_in_process(item, &error);
                    contribution.process_skip_count += 1;
                    return Ok(None);
                }
            }
        }
    }

    fn write_chunk(
        &self,
        outputs: Vec<O>,
        contribution: &mut StepContribution,
        skips_before: usize,
        transaction: &mut ChunkTransaction<'_>,
    ) -> Result<(), BatchError> {
        if outputs.is_empty() {
            debug!("No items to write, skipping write call");
            return Ok(());
        }
        debug!("Writing chunk of {} items", outputs.len());

        let mut attempt = 0;
        loop {
            self.listeners.before_write(&outputs)?;
            match self.write_items(&outputs) {
                Ok(()) => {
                    self.listeners.after_write(&outputs)?;
                    contribution.write_count += outputs.len();
                    return Ok(());
                }
                Err(error) => {
                    warn!("Error writing chunk of {} items: {}", outputs.len(), error);
                    self.listeners.on_write_error(&error, &outputs);
                    transaction.restart()?;
                    attempt += 1;
                    if self.retry(&error, attempt) {
                        continue;
                    }
                    if !self.scan_on_write_failure {
                        error!("Write failure with scan disabled, failing chunk");
                        return Err(exhausted(error, attempt));
                    }
                    return self.scan(outputs, contribution, skips_before, transaction);
                }
            }
        }
    }

    /// Writes the items one at a time to find which ones make the batch fail.
    ///
    /// With a transactional resource, every failed single write restarts the
    /// scope and the items already cleared are written again, so the scope
    /// only ever holds the writes of healthy items. A resourceless scope
    /// cannot undo anything, so cleared items stay written and are never
    /// replayed.
    fn scan(
        &self,
        outputs: Vec<O>,
        contribution: &mut StepContribution,
        skips_before: usize,
        transaction: &mut ChunkTransaction<'_>,
    ) -> Result<(), BatchError> {
        let total = outputs.len();
        info!("Scanning chunk of {} items to localize write failure", total);

        let mut cleared: Vec<O> = Vec::with_capacity(total);
        for (index, item) in outputs.into_iter().enumerate() {
            let mut attempt = 0;
            loop {
                let single = slice::from_ref(&item);
                self.listeners.before_write(single)?;
                match self.write_items(single) {
                    Ok(()) => {
                        self.listeners.after_write(single)?;
                        cleared.push(item);
                        break;
                    }
                    Err(error) => {
                        self.listeners.on_write_error(&error, single);
                        if transaction.is_transactional() {
                            transaction.restart()?;
                            self.replay(&cleared)?;
                        }
                        attempt += 1;
                        if self.retry(&error, attempt) {
                            continue;
                        }
                        let skip_count = skips_before + contribution.skip_count();
                        let error = self.check_skip(error, attempt, skip_count).inspect_err(|_| {
                            error!("Write failed for item {} of {} in chunk", index + 1, total);
                        })?;
                        warn!("Skipping item {} of {} on write: {}", index + 1, total, error);
                        self.listeners.on_skip_in_write(&item, &error);
                        contribution.write_skip_count += 1;
                        break;
                    }
                }
            }
        }

        contribution.write_count += cleared.len();
        Ok(())
    }

    fn replay(&self, cleared: &[O]) -> Result<(), BatchError> {
        if cleared.is_empty() {
            return Ok(());
        }
        debug!("Replaying {} cleared items", cleared.len());
        self.write_items(cleared)
    }

    fn write_items(&self, items: &[O]) -> Result<(), BatchError> {
        self.writer.write(items)?;
        self.writer.flush()
    }

    fn retry(&self, error: &BatchError, attempt: usize) -> bool {
        if !self.retry_policy.should_retry(error, attempt) {
            return false;
        }
        let delay = self.retry_policy.backoff(attempt);
        if !delay.is_zero() {
            debug!("Backing off {:?} before attempt {}", delay, attempt + 1);
            thread::sleep(delay);
        }
        true
    }

    /// Returns the error back when it may be skipped, the fatal error otherwise.
    fn check_skip(
        &self,
        error: BatchError,
        attempt: usize,
        skip_count: usize,
    ) -> Result<BatchError, BatchError> {
        if self.skip_policy.should_skip(&error, skip_count) {
            Ok(error)
        } else {
            Err(self.fatal(error, attempt, skip_count))
        }
    }

    fn fatal(&self, error: BatchError, attempt: usize, skip_count: usize) -> BatchError {
        if self.skip_policy.is_skippable(&error) {
            BatchError::SkipLimitExceeded {
                skip_count,
                source: Box::new(error),
            }
        } else {
            exhausted(error, attempt)
        }
    }
}

fn exhausted(error: BatchError, attempt: usize) -> BatchError {
    if attempt > 1 {
        BatchError::RetryExhausted {
            attempts: attempt,
            source: Box::new(error),
        }
    } else {
        error
    }
}
