//! Aggregate counters embedded on owning rows.
//!
//! Counters are derived values: every one of them can be recomputed from the
//! rows it summarizes. Updates come in two modes. [`CounterMode::Strict`]
//! raises when the row is missing or the condition fails, and is used next
//! to writes that were just verified. [`CounterMode::FailSoft`] reports
//! those cases as a [`CounterOutcome`] instead, and is used by asynchronous
//! reconciliation where the row may have been deleted concurrently.
//!
//! Decrements are conditioned on the counter being at least the amount, so
//! a counter never goes below zero at the store level.

use std::sync::Arc;

use tracing::debug;

use crate::storage::{Condition, Key, PreparedWrite, Store, StoreError, UpdateAction};

/// Result type for strict counter updates.
pub type Result<T> = std::result::Result<T, CounterError>;

/// Errors raised by strict counter updates.
#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("Counter row {key} not found")]
    NotFound { key: Key },

    #[error("Condition failed updating `{field}` on {key}")]
    ConditionFailed { key: Key, field: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Whether soft failures raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    Strict,
    FailSoft,
}

/// Outcome of a counter update.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOutcome {
    Applied,
    /// The row does not exist.
    NotFound,
    /// The row exists but the update's condition did not hold.
    ConditionFailed,
}

impl CounterOutcome {
    pub fn is_applied(self) -> bool {
        self == CounterOutcome::Applied
    }
}

/// Typed counter updates against one table.
#[derive(Clone)]
pub struct CounterStore {
    store: Arc<dyn Store>,
}

impl CounterStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn increment(
        &self,
        key: &Key,
        field: &str,
        amount: i64,
        mode: CounterMode,
    ) -> Result<CounterOutcome> {
        self.apply(key, vec![UpdateAction::add(field, amount)], None, mode)
            .await
    }

    /// Decrement, refusing to go below zero.
    pub async fn decrement(
        &self,
        key: &Key,
        field: &str,
        amount: i64,
        mode: CounterMode,
    ) -> Result<CounterOutcome> {
        self.apply(
            key,
            vec![UpdateAction::add(field, -amount)],
            Some(Condition::at_least(field, amount)),
            mode,
        )
        .await
    }

    /// Reset a counter to zero.
    pub async fn clear(&self, key: &Key, field: &str, mode: CounterMode) -> Result<CounterOutcome> {
        self.apply(key, vec![UpdateAction::set(field, 0)], None, mode)
            .await
    }

    /// Apply updates to an existing row.
    ///
    /// A condition failure is followed by a consistent read to tell a missing
    /// row apart from a false condition.
    pub async fn apply(
        &self,
        key: &Key,
        actions: Vec<UpdateAction>,
        condition: Option<Condition>,
        mode: CounterMode,
    ) -> Result<CounterOutcome> {
        let condition = match condition {
            Some(extra) => Condition::And(vec![Condition::Exists, extra]),
            None => Condition::Exists,
        };
        let field = actions
            .first()
            .map(|action| match action {
                UpdateAction::Set(attr, _) | UpdateAction::Add(attr, _) | UpdateAction::Remove(attr) => {
                    attr.clone()
                }
            })
            .unwrap_or_default();

        match self.store.update(key, actions, Some(condition)).await {
            Ok(_) => Ok(CounterOutcome::Applied),
            Err(StoreError::ConditionFailed { .. }) => {
                let outcome = match self.store.get(key, true).await? {
                    None => CounterOutcome::NotFound,
                    Some(_) => CounterOutcome::ConditionFailed,
                };
                match mode {
                    CounterMode::FailSoft => {
                        debug!(key = %key, field = %field, ?outcome, "Ignoring counter update");
                        Ok(outcome)
                    }
                    CounterMode::Strict => match outcome {
                        CounterOutcome::NotFound => Err(CounterError::NotFound { key: key.clone() }),
                        _ => Err(CounterError::ConditionFailed {
                            key: key.clone(),
                            field,
                        }),
                    },
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Increment as a transaction write; fails the transaction if the row
    /// is absent.
    pub fn transact_increment(key: Key, field: &str, amount: i64) -> PreparedWrite {
        PreparedWrite::update_if_exists(key, vec![UpdateAction::add(field, amount)], None)
    }

    /// Decrement as a transaction write; fails the transaction if the row is
    /// absent or the counter would go below zero.
    pub fn transact_decrement(key: Key, field: &str, amount: i64) -> PreparedWrite {
        PreparedWrite::update_if_exists(
            key,
            vec![UpdateAction::add(field, -amount)],
            Some(Condition::at_least(field, amount)),
        )
    }
}
