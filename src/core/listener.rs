//! Listener callbacks invoked by the engine.
//!
//! Every method has a no-op default, so implementors only override the
//! hooks they need. `before_*` and `after_*` hooks return a `Result` and a
//! failure there is fatal to the step (or job). Error and skip callbacks are
//! notifications: their failures are logged and otherwise ignored.

use log::warn;

use crate::BatchError;

use super::execution::{JobExecution, StepExecution};

pub trait JobListener {
    fn before_job(&self, _job_execution: &JobExecution) -> Result<(), BatchError> {
        Ok(())
    }

    fn after_job(&self, _job_execution: &JobExecution) -> Result<(), BatchError> {
        Ok(())
    }
}

pub trait StepListener {
    fn before_step(&self, _step_execution: &StepExecution) -> Result<(), BatchError> {
        Ok(())
    }

    fn after_step(&self, _step_execution: &StepExecution) -> Result<(), BatchError> {
        Ok(())
    }
}

pub trait ChunkListener {
    fn before_chunk(&self, _step_execution: &StepExecution) -> Result<(), BatchError> {
        Ok(())
    }

    /// Called once the chunk has been committed.
    fn after_chunk(&self, _step_execution: &StepExecution) -> Result<(), BatchError> {
        Ok(())
    }

    /// Called once the chunk has been rolled back.
    fn after_chunk_error(
        &self,
        _step_execution: &StepExecution,
        _error: &BatchError,
    ) -> Result<(), BatchError> {
        Ok(())
    }
}

pub trait ItemReadListener<I> {
    fn before_read(&self) -> Result<(), BatchError> {
        Ok(())
    }

    fn after_read(&self, _item: &I) -> Result<(), BatchError> {
        Ok(())
    }

    fn on_read_error(&self, _error: &BatchError) -> Result<(), BatchError> {
        Ok(())
    }
}

pub trait ItemProcessListener<I, O> {
    fn before_process(&self, _item: &I) -> Result<(), BatchError> {
        Ok(())
    }

    /// `result` is `None` when the processor filtered the item.
    fn after_process(&self, _item: &I, _result: Option<&O>) -> Result<(), BatchError> {
        Ok(())
    }

    fn on_process_error(&self, _item: &I, _error: &BatchError) -> Result<(), BatchError> {
        Ok(())
    }
}

pub trait ItemWriteListener<O> {
    fn before_write(&self, _items: &[O]) -> Result<(), BatchError> {
        Ok(())
    }

    fn after_write(&self, _items: &[O]) -> Result<(), BatchError> {
        Ok(())
    }

    fn on_write_error(&self, _error: &BatchError, _items: &[O]) -> Result<(), BatchError> {
        Ok(())
    }
}

pub trait SkipListener<I, O> {
    fn on_skip_in_read(&self, _error: &BatchError) -> Result<(), BatchError> {
        Ok(())
    }

    fn on_skip_in_process(&self, _item: &I, _error: &BatchError) -> Result<(), BatchError> {
        Ok(())
    }

    fn on_skip_in_write(&self, _item: &O, _error: &BatchError) -> Result<(), BatchError> {
        Ok(())
    }
}

fn notify(hook: &'static str, result: Result<(), BatchError>) {
    if let Err(error) = result {
        warn!("Listener {} failed, ignoring: {}", hook, error);
    }
}

/// Listeners registered on a chunk-oriented step.
pub struct StepListeners<'a, I, O> {
    pub(crate) step: Vec<&'a dyn StepListener>,
    pub(crate) chunk: Vec<&'a dyn ChunkListener>,
    pub(crate) read: Vec<&'a dyn ItemReadListener<I>>,
    pub(crate) process: Vec<&'a dyn ItemProcessListener<I, O>>,
    pub(crate) write: Vec<&'a dyn ItemWriteListener<O>>,
    pub(crate) skip: Vec<&'a dyn SkipListener<I, O>>,
}

impl<I, O> Default for StepListeners<'_, I, O> {
    fn default() -> Self {
        Self {
            step: Vec::new(),
            chunk: Vec::new(),
            read: Vec::new(),
            process: Vec::new(),
            write: Vec::new(),
            skip: Vec::new(),
        }
    }
}

impl<I, O> StepListeners<'_, I, O> {
    pub(crate) fn before_step(&self, execution: &StepExecution) -> Result<(), BatchError> {
        self.step
            .iter()
            .try_for_each(|listener| listener.before_step(execution))
    }

    pub(crate) fn after_step(&self, execution: &StepExecution) -> Result<(), BatchError> {
        self.step
            .iter()
            .try_for_each(|listener| listener.after_step(execution))
    }

    pub(crate) fn before_chunk(&self, execution: &StepExecution) -> Result<(), BatchError> {
        self.chunk
            .iter()
            .try_for_each(|listener| listener.before_chunk(execution))
    }

    pub(crate) fn after_chunk(&self, execution: &StepExecution) -> Result<(), BatchError> {
        self.chunk
            .iter()
            .try_for_each(|listener| listener.after_chunk(execution))
    }

    pub(crate) fn after_chunk_error(&self, execution: &StepExecution, error: &BatchError) {
        for listener in &self.chunk {
            notify("after_chunk_error", listener.after_chunk_error(execution, error));
        }
    }

    pub(crate) fn before_read(&self) -> Result<(), BatchError> {
        self.read.iter().try_for_each(|listener| listener.before_read())
    }

    pub(crate) fn after_read(&self, item: &I) -> Result<(), BatchError> {
        self.read
            .iter()
            .try_for_each(|listener| listener.after_read(item))
    }

    pub(crate) fn on_read_error(&self, error: &BatchError) {
        for listener in &self.read {
            notify("on_read_error", listener.on_read_error(error));
        }
    }

    pub(crate) fn before_process(&self, item: &I) -> Result<(), BatchError> {
        self.process
            .iter()
            .try_for_each(|listener| listener.before_process(item))
    }

    pub(crate) fn after_process(&self, item: &I, result: Option<&O>) -> Result<(), BatchError> {
        self.process
            .iter()
            .try_for_each(|listener| listener.after_process(item, result))
    }

    pub(crate) fn on_process_error(&self, item: &I, error: &BatchError) {
        for listener in &self.process {
            notify("on_process_error", listener.on_process_error(item, error));
        }
    }

    pub(crate) fn before_write(&self, items: &[O]) -> Result<(), BatchError> {
        self.write
            .iter()
            .try_for_each(|listener| listener.before_write(items))
    }

    pub(crate) fn after_write(&self, items: &[O]) -> Result<(), BatchError> {
        self.write
            .iter()
            .try_for_each(|listener| listener.after_write(items))
    }

    pub(crate) fn on_write_error(&self, error: &BatchError, items: &[O]) {
        for listener in &self.write {
            notify("on_write_error", listener.on_write_error(error, items));
        }
    }

    pub(crate) fn on_skip_in_read(&self, error: &BatchError) {
        for listener in &self.skip {
            notify("on_skip_in_read", listener.on_skip_in_read(error));
        }
    }

    pub(crate) fn on_skip_in_process(&self, item: &I, error: &BatchError) {
        for listener in &self.skip {
            notify("on_skip_in_process", listener.on_skip_in_process(item, error));
        }
    }

    pub(crate) fn on_skip_in_write(&self, item: &O, error: &BatchError) {
        for listener in &self.skip {
            notify("on_skip_in_write", listener.on_skip_in_write(item, error));
        }
    }
}
