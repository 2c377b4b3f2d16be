use std::cell::{Cell, RefCell};

use crate::{
    BatchError,
    core::{
        context::ExecutionContext,
        item::{ItemReader, ItemReaderResult, ItemStream, ItemWriter, ItemWriterResult},
    },
};

/// Reader returning the items of a list in order.
///
/// The number of items handed out is stored under `{name}.read.count` at
/// every commit, so a restarted step continues after the last committed
/// item.
pub struct ListItemReader<T> {
    name: String,
    items: Vec<T>,
    index: Cell<usize>,
}

impl<T> ListItemReader<T> {
    pub fn new(name: &str, items: Vec<T>) -> Self {
        Self {
            name: name.to_string(),
            items,
            index: Cell::new(0),
        }
    }

    fn count_key(&self) -> String {
        format!("{}.read.count", self.name)
    }
}

impl<T> ItemStream for ListItemReader<T> {
    fn open(&self, context: &ExecutionContext) -> Result<(), BatchError> {
        let start = match context.get_long(&self.count_key()) {
            Some(count) => usize::try_from(count).map_err(|_| {
                BatchError::Configuration(format!("invalid read count {} in context", count))
            })?,
            None => 0,
        };
        self.index.set(start);
        Ok(())
    }

    fn update(&self, context: &mut ExecutionContext) -> Result<(), BatchError> {
        context.put(self.count_key(), self.index.get());
        Ok(())
    }
}

impl<T: Clone> ItemReader<T> for ListItemReader<T> {
    fn read(&self) -> ItemReaderResult<T> {
        let index = self.index.get();
        match self.items.get(index) {
            Some(item) => {
                self.index.set(index + 1);
                Ok(Some(item.clone()))
            }
            None => Ok(None),
        }
    }
}

/// Writer collecting every written item in memory.
pub struct ListItemWriter<T> {
    items: RefCell<Vec<T>>,
}

impl<T> Default for ListItemWriter<T> {
    fn default() -> Self {
        Self {
            items: RefCell::new(Vec::new()),
        }
    }
}

impl<T: Clone> ListItemWriter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<T> {
        self.items.borrow().clone()
    }
}

impl<T> ItemStream for ListItemWriter<T> {}

impl<T: Clone> ItemWriter<T> for ListItemWriter<T> {
    fn write(&self, items: &[T]) -> ItemWriterResult {
        self.items.borrow_mut().extend_from_slice(items);
        Ok(())
    }
}
