use log::{debug, warn};

use crate::BatchError;

/// One transactional scope opened against an external resource.
pub trait Transaction {
    fn commit(self: Box<Self>) -> Result<(), BatchError>;

    fn rollback(self: Box<Self>) -> Result<(), BatchError>;
}

/// Opens the transactional scope used for each chunk.
pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, BatchError>;

    /// Whether a rollback really discards the writes made in the scope.
    fn is_transactional(&self) -> bool {
        true
    }
}

/// Transaction manager for steps whose writers are not transactional.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourcelessTransactionManager;

struct ResourcelessTransaction;

impl Transaction for ResourcelessTransaction {
    fn commit(self: Box<Self>) -> Result<(), BatchError> {
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), BatchError> {
        Ok(())
    }
}

impl TransactionManager for ResourcelessTransactionManager {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, BatchError> {
        Ok(Box::new(ResourcelessTransaction))
    }

    fn is_transactional(&self) -> bool {
        false
    }
}

/// Transaction scope of one chunk.
///
/// The scope can be restarted while the chunk is in flight: a failed batch
/// write leaves the resource in an unknown state, so it is rolled back and a
/// fresh transaction is begun before the write is retried or scanned.
pub struct ChunkTransaction<'t> {
    manager: &'t dyn TransactionManager,
    current: Option<Box<dyn Transaction + 't>>,
}

impl<'t> ChunkTransaction<'t> {
    pub fn begin(manager: &'t dyn TransactionManager) -> Result<Self, BatchError> {
        let current = manager.begin()?;
        Ok(Self {
            manager,
            current: Some(current),
        })
    }

    pub fn is_transactional(&self) -> bool {
        self.manager.is_transactional()
    }

    /// Rolls back the current transaction and begins a new one.
    pub fn restart(&mut self) -> Result<(), BatchError> {
        if let Some(transaction) = self.current.take() {
            transaction.rollback()?;
        }
        debug!("Chunk transaction restarted");
        self.current = Some(self.manager.begin()?);
        Ok(())
    }

    pub fn commit(mut self) -> Result<(), BatchError> {
        match self.current.take() {
            Some(transaction) => transaction.commit(),
            None => Err(BatchError::Transaction(
                "no active chunk transaction".to_string(),
            )),
        }
    }

    pub fn rollback(mut self) -> Result<(), BatchError> {
        match self.current.take() {
            Some(transaction) => transaction.rollback(),
            None => Ok(()),
        }
    }
}

impl Drop for ChunkTransaction<'_> {
    fn drop(&mut self) {
        if let Some(transaction) = self.current.take() {
            if let Err(error) = transaction.rollback() {
                warn!("Rollback of abandoned chunk transaction failed: {}", error);
            }
        }
    }
}
