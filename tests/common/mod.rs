#![allow(dead_code)]

pub mod mocks;

use std::{
    cell::Cell,
    collections::HashMap,
    mem,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use spring_batch_engine::{
    BatchError,
    core::{
        item::{
            ItemProcessor, ItemProcessorResult, ItemReader, ItemReaderResult, ItemStream,
            ItemWriter, ItemWriterResult,
        },
        transaction::{Transaction, TransactionManager},
    },
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct BufferState<T> {
    pending: Vec<T>,
    committed: Vec<T>,
    write_calls: usize,
    commits: usize,
    rollbacks: usize,
}

/// Transactional sink: writes are buffered in the open transaction and only
/// become visible in [`committed`](BufferedResource::committed) on commit.
///
/// The resource is its own transaction manager.
pub struct BufferedResource<T> {
    state: Mutex<BufferState<T>>,
    poison: Box<dyn Fn(&T) -> bool + Send + Sync>,
    transient_failures: AtomicUsize,
    fail_commit_number: AtomicUsize,
}

impl<T: Clone + Send> BufferedResource<T> {
    pub fn new() -> Self {
        Self::poisoned(|_| false)
    }

    /// Any batch containing an item matching `poison` fails with `db.Constraint`.
    pub fn poisoned(poison: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(BufferState {
                pending: Vec::new(),
                committed: Vec::new(),
                write_calls: 0,
                commits: 0,
                rollbacks: 0,
            }),
            poison: Box::new(poison),
            transient_failures: AtomicUsize::new(0),
            fail_commit_number: AtomicUsize::new(0),
        }
    }

    /// The next `count` writes fail with `db.Deadlock`.
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// The commit with this 1-based number is refused.
    pub fn with_failing_commit(self, number: usize) -> Self {
        self.fail_commit_number.store(number, Ordering::SeqCst);
        self
    }

    pub fn committed(&self) -> Vec<T> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn write_calls(&self) -> usize {
        self.state.lock().unwrap().write_calls
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }
}

impl<T> ItemStream for BufferedResource<T> {}

impl<T: Clone + Send> ItemWriter<T> for BufferedResource<T> {
    fn write(&self, items: &[T]) -> ItemWriterResult {
        let mut state = self.state.lock().unwrap();
        state.write_calls += 1;

        let transient = self.transient_failures.load(Ordering::SeqCst);
        if transient > 0 {
            self.transient_failures.store(transient - 1, Ordering::SeqCst);
            return Err(BatchError::writer("db.Deadlock", "deadlock detected"));
        }
        if items.iter().any(|item| (self.poison)(item)) {
            return Err(BatchError::writer("db.Constraint", "constraint violation"));
        }

        state.pending.extend_from_slice(items);
        Ok(())
    }
}

struct BufferedTransaction<'a, T> {
    resource: &'a BufferedResource<T>,
}

impl<T> Transaction for BufferedTransaction<'_, T> {
    fn commit(self: Box<Self>) -> Result<(), BatchError> {
        let mut state = self.resource.state.lock().unwrap();
        let number = state.commits + 1;
        if self.resource.fail_commit_number.load(Ordering::SeqCst) == number {
            state.pending.clear();
            state.rollbacks += 1;
            self.resource.fail_commit_number.store(0, Ordering::SeqCst);
            return Err(BatchError::Transaction("commit refused".to_string()));
        }
        let pending = mem::take(&mut state.pending);
        state.committed.extend(pending);
        state.commits = number;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), BatchError> {
        let mut state = self.resource.state.lock().unwrap();
        state.pending.clear();
        state.rollbacks += 1;
        Ok(())
    }
}

impl<T: Send> TransactionManager for BufferedResource<T> {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, BatchError> {
        Ok(Box::new(BufferedTransaction { resource: self }))
    }
}

/// Sink outside any transaction: accepted items are visible at once and a
/// rejected batch writes nothing.
pub struct DirectSink {
    items: Mutex<Vec<u32>>,
    rejected: u32,
}

impl DirectSink {
    /// Rejects with `db.Constraint` any batch containing `rejected`.
    pub fn rejecting(rejected: u32) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            rejected,
        }
    }

    pub fn items(&self) -> Vec<u32> {
        self.items.lock().unwrap().clone()
    }
}

impl ItemStream for DirectSink {}

impl ItemWriter<u32> for DirectSink {
    fn write(&self, items: &[u32]) -> ItemWriterResult {
        if items.contains(&self.rejected) {
            return Err(BatchError::writer("db.Constraint", "constraint violation"));
        }
        self.items.lock().unwrap().extend_from_slice(items);
        Ok(())
    }
}

/// Reader replaying a script: `Ok` entries are items, `Err` entries are
/// read failures of the given kind.
pub struct ScriptedReader {
    script: Vec<Result<u32, &'static str>>,
    index: Cell<usize>,
}

impl ScriptedReader {
    pub fn new(script: Vec<Result<u32, &'static str>>) -> Self {
        Self {
            script,
            index: Cell::new(0),
        }
    }

    pub fn items(items: impl IntoIterator<Item = u32>) -> Self {
        Self::new(items.into_iter().map(Ok).collect())
    }
}

impl ItemStream for ScriptedReader {}

impl ItemReader<u32> for ScriptedReader {
    fn read(&self) -> ItemReaderResult<u32> {
        let index = self.index.get();
        self.index.set(index + 1);
        match self.script.get(index) {
            Some(Ok(item)) => Ok(Some(*item)),
            Some(Err(kind)) => Err(BatchError::reader(*kind, format!("entry {}", index))),
            None => Ok(None),
        }
    }
}

/// Processor filtering multiples of `filter_multiple` and failing on chosen
/// items with a given kind, a limited number of times or forever.
pub struct ScriptedProcessor {
    filter_multiple: Option<u32>,
    failures: HashMap<u32, (&'static str, usize)>,
    attempts: Mutex<HashMap<u32, usize>>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self {
            filter_multiple: None,
            failures: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn filtering_multiples_of(mut self, multiple: u32) -> Self {
        self.filter_multiple = Some(multiple);
        self
    }

    /// `item` fails with `kind` on its first `times` attempts.
    pub fn failing(mut self, item: u32, kind: &'static str, times: usize) -> Self {
        self.failures.insert(item, (kind, times));
        self
    }

    pub fn attempts(&self, item: u32) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(&item)
            .copied()
            .unwrap_or(0)
    }
}

impl ItemProcessor<u32, u32> for ScriptedProcessor {
    fn process(&self, item: &u32) -> ItemProcessorResult<u32> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let attempt = attempts.entry(*item).or_insert(0);
            *attempt += 1;
            *attempt
        };

        if let Some((kind, times)) = self.failures.get(item) {
            if attempt <= *times {
                return Err(BatchError::processor(*kind, format!("item {}", item)));
            }
        }
        if matches!(self.filter_multiple, Some(multiple) if item % multiple == 0) {
            return Ok(None);
        }
        Ok(Some(*item))
    }
}

/// Flag shared between a test and the components it arms.
#[derive(Default)]
pub struct Switch(AtomicBool);

impl Switch {
    pub fn on() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
