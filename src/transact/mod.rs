//! Transaction coordinator.
//!
//! Executes an ordered list of [`PreparedWrite`]s as one atomic unit and maps
//! a store-reported condition failure back to the domain error supplied for
//! that position. The shape of a transaction (which rows, in what order) is
//! decided by the caller; the coordinator only guarantees atomic execution
//! and deterministic error mapping.
//!
//! Nothing here retries. Condition failures are semantic, and infrastructure
//! failures are surfaced as [`TransactError::Store`] for the caller to retry.

use std::convert::Infallible;
use std::sync::Arc;

use tracing::debug;

use crate::storage::{PreparedWrite, Store, StoreError};

/// Errors from committing a transaction plan.
#[derive(Debug, thiserror::Error)]
pub enum TransactError<E> {
    /// The domain error registered for the write whose condition failed.
    #[error("{0}")]
    Rejected(E),

    /// A write failed its condition and no domain error was registered.
    #[error("Transaction write {index:?} failed its condition")]
    ConditionFailed { index: Option<usize> },

    #[error("Transaction has {count} writes, limit is {max}")]
    TooManyWrites { count: usize, max: usize },

    #[error("Transaction has {writes} writes but {errors} error slots")]
    Misaligned { writes: usize, errors: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Transaction failure carrying no domain error.
pub type TransactFailure = TransactError<Infallible>;

impl<E> TransactError<E> {
    /// True for infrastructure failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransactError::Store(e) if e.is_retryable())
    }

    /// Collapse into the domain error type.
    ///
    /// A rejection yields its registered error; every other failure is
    /// converted through `From<TransactFailure>`.
    pub fn into_domain(self) -> E
    where
        E: From<TransactFailure>,
    {
        match self {
            TransactError::Rejected(e) => e,
            TransactError::ConditionFailed { index } => {
                E::from(TransactError::ConditionFailed { index })
            }
            TransactError::TooManyWrites { count, max } => {
                E::from(TransactError::TooManyWrites { count, max })
            }
            TransactError::Misaligned { writes, errors } => {
                E::from(TransactError::Misaligned { writes, errors })
            }
            TransactError::Store(e) => E::from(TransactError::Store(e)),
        }
    }
}

/// Ordered writes and, per write, the domain error to raise if its
/// condition fails.
#[derive(Debug)]
pub struct TransactPlan<E> {
    writes: Vec<PreparedWrite>,
    errors: Vec<Option<E>>,
}

impl<E> Default for TransactPlan<E> {
    fn default() -> Self {
        Self {
            writes: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<E> TransactPlan<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from parallel lists, which must have the same length.
    pub fn from_parts(
        writes: Vec<PreparedWrite>,
        errors: Vec<Option<E>>,
    ) -> Result<Self, TransactError<E>> {
        if writes.len() != errors.len() {
            return Err(TransactError::Misaligned {
                writes: writes.len(),
                errors: errors.len(),
            });
        }
        Ok(Self { writes, errors })
    }

    /// Append a write with the error to raise if its condition fails.
    pub fn push(&mut self, write: PreparedWrite, error: Option<E>) {
        self.writes.push(write);
        self.errors.push(error);
    }

    /// Builder form of [`TransactPlan::push`].
    pub fn with(mut self, write: PreparedWrite, error: Option<E>) -> Self {
        self.push(write, error);
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[PreparedWrite] {
        &self.writes
    }
}

/// Commits transaction plans against one table.
#[derive(Clone)]
pub struct TransactionCoordinator {
    store: Arc<dyn Store>,
    max_items: usize,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn Store>, max_items: usize) -> Self {
        Self { store, max_items }
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Execute every write of the plan atomically.
    ///
    /// An empty plan is a no-op. A plan larger than the configured bound is
    /// refused before reaching the store.
    pub async fn commit<E>(&self, plan: TransactPlan<E>) -> Result<(), TransactError<E>> {
        if plan.is_empty() {
            return Ok(());
        }
        if plan.len() > self.max_items {
            return Err(TransactError::TooManyWrites {
                count: plan.len(),
                max: self.max_items,
            });
        }

        let TransactPlan { writes, mut errors } = plan;
        let count = writes.len();
        match self.store.transact_write(writes).await {
            Ok(()) => Ok(()),
            Err(StoreError::TransactionCanceled { index: Some(index) }) => {
                debug!(index, count, "Transaction rejected");
                match errors.get_mut(index).and_then(Option::take) {
                    Some(e) => Err(TransactError::Rejected(e)),
                    None => Err(TransactError::ConditionFailed { index: Some(index) }),
                }
            }
            Err(StoreError::TransactionCanceled { index: None }) => {
                debug!(count, "Transaction rejected without a failed index");
                Err(TransactError::ConditionFailed { index: None })
            }
            Err(StoreError::TooManyItems { count, max }) => {
                Err(TransactError::TooManyWrites { count, max })
            }
            Err(e) => Err(TransactError::Store(e)),
        }
    }
}

#[cfg(test)]
mod tests;
