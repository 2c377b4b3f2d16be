use crate::error::BatchError;

use super::context::ExecutionContext;

/// Result of a read: `Ok(None)` signals the end of data.
pub type ItemReaderResult<I> = Result<Option<I>, BatchError>;

/// Result of a process call: `Ok(None)` filters the item out.
pub type ItemProcessorResult<O> = Result<Option<O>, BatchError>;

pub type ItemWriterResult = Result<(), BatchError>;

/// Stream callbacks shared by readers and writers.
///
/// `open` receives the context of the step execution, which on restart holds
/// whatever `update` stored during the last committed chunk.
pub trait ItemStream {
    fn open(&self, _context: &ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    /// Stores the current position. Called right before each chunk commit.
    fn update(&self, _context: &mut ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    fn close(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Source of items, read one at a time.
pub trait ItemReader<I>: ItemStream {
    fn read(&self) -> ItemReaderResult<I>;
}

/// Business logic applied to each item read.
pub trait ItemProcessor<I, O> {
    fn process(&self, item: &I) -> ItemProcessorResult<O>;
}

/// Sink receiving the items of a chunk in one call.
///
/// A failure is attributed to the whole batch, not to an item.
pub trait ItemWriter<O>: ItemStream {
    fn write(&self, items: &[O]) -> ItemWriterResult;

    fn flush(&self) -> ItemWriterResult {
        Ok(())
    }
}

/// Processor returning a copy of each item.
#[derive(Default)]
pub struct PassThroughProcessor;

impl<I: Clone> ItemProcessor<I, I> for PassThroughProcessor {
    fn process(&self, item: &I) -> ItemProcessorResult<I> {
        Ok(Some(item.clone()))
    }
}
