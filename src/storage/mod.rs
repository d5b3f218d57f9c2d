//! Key-value store abstraction.
//!
//! Every entity is a row addressed by a `(partition, sort)` key in one logical
//! table. The only cross-row atomicity primitive is [`Store::transact_write`],
//! a bounded all-or-nothing group of conditional writes. Secondary indexes are
//! described by a [`TableSchema`] and queried with [`Query`].
//!
//! Implementations:
//! - `MemoryStore`: in-process store, used in tests and standalone mode
//! - `DynamoStore`: DynamoDB (feature `dynamo`)
//! - `TimeoutStore`: decorator bounding every call with a timeout

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::{StoreConfig, StoreType};

pub mod change;
pub mod helpers;
pub mod memory;
pub mod schema;
pub mod timeout;

#[cfg(feature = "dynamo")]
pub mod dynamo;

pub use change::{ChangeKind, ChangeRecord};
pub use helpers::{from_item, to_item};
pub use memory::MemoryStore;
pub use schema::{IndexSchema, TableSchema};
pub use timeout::TimeoutStore;

#[cfg(feature = "dynamo")]
pub use dynamo::DynamoStore;

/// Attribute map of a single row.
pub type Item = HashMap<String, Value>;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
///
/// Semantic rejections (`ConditionFailed`, `TransactionCanceled`) are never
/// retryable; infrastructure failures are, see [`StoreError::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Condition failed on {partition}/{sort}")]
    ConditionFailed { partition: String, sort: String },

    #[error("Transaction canceled (failed write index: {index:?})")]
    TransactionCanceled { index: Option<usize> },

    #[error("Transaction has {count} writes, store accepts at most {max}")]
    TooManyItems { count: usize, max: usize },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Store throttled the request: {0}")]
    Throttled(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call `{operation}` timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Item serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Infrastructure failures where a caller-level retry with backoff is
    /// appropriate. Condition failures are semantic and never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Throttled(_) | StoreError::Unavailable(_) | StoreError::Timeout { .. }
        )
    }

    /// True for a single-item condition failure or a canceled transaction.
    pub fn is_condition_failure(&self) -> bool {
        matches!(
            self,
            StoreError::ConditionFailed { .. } | StoreError::TransactionCanceled { .. }
        )
    }
}

/// Primary key of a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub partition: String,
    pub sort: String,
}

impl Key {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.partition, self.sort)
    }
}

/// Precondition on the current state of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The row exists.
    Exists,
    /// The row does not exist.
    NotExists,
    /// The attribute is present and equal to the value.
    Equals(String, Value),
    /// The numeric attribute is present and `>=` the bound.
    AtLeast(String, i64),
    /// The attribute is present and orders before the value. Strings compare
    /// lexicographically, numbers numerically.
    LessThan(String, Value),
    /// The row lacks the attribute (or is absent).
    AttributeNotExists(String),
    /// All conditions hold.
    And(Vec<Condition>),
    /// At least one condition holds.
    Or(Vec<Condition>),
}

impl Condition {
    pub fn equals(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Equals(attr.into(), value.into())
    }

    pub fn at_least(attr: impl Into<String>, bound: i64) -> Self {
        Condition::AtLeast(attr.into(), bound)
    }

    /// The attribute is missing or orders before `value`.
    pub fn missing_or_before(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        let attr = attr.into();
        Condition::Or(vec![
            Condition::AttributeNotExists(attr.clone()),
            Condition::LessThan(attr, value.into()),
        ])
    }

    /// Evaluate against the current row (`None` when absent).
    pub fn evaluate(&self, current: Option<&Item>) -> bool {
        match self {
            Condition::Exists => current.is_some(),
            Condition::NotExists => current.is_none(),
            Condition::Equals(attr, value) => {
                current.and_then(|item| item.get(attr)) == Some(value)
            }
            Condition::AtLeast(attr, bound) => current
                .and_then(|item| item.get(attr))
                .and_then(Value::as_i64)
                .is_some_and(|n| n >= *bound),
            Condition::LessThan(attr, value) => {
                match (current.and_then(|item| item.get(attr)), value) {
                    (Some(Value::String(a)), Value::String(b)) => a < b,
                    (Some(Value::Number(a)), Value::Number(b)) => {
                        match (a.as_f64(), b.as_f64()) {
                            (Some(a), Some(b)) => a < b,
                            _ => false,
                        }
                    }
                    _ => false,
                }
            }
            Condition::AttributeNotExists(attr) => {
                current.map_or(true, |item| !item.contains_key(attr))
            }
            Condition::And(conditions) => conditions.iter().all(|c| c.evaluate(current)),
            Condition::Or(conditions) => conditions.iter().any(|c| c.evaluate(current)),
        }
    }
}

/// Single attribute mutation of an update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    Set(String, Value),
    /// Numeric add; a missing attribute counts as zero.
    Add(String, i64),
    Remove(String),
}

impl UpdateAction {
    pub fn set(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        UpdateAction::Set(attr.into(), value.into())
    }

    pub fn add(attr: impl Into<String>, amount: i64) -> Self {
        UpdateAction::Add(attr.into(), amount)
    }

    /// Apply to an item in place.
    pub fn apply(&self, item: &mut Item) {
        match self {
            UpdateAction::Set(attr, value) => {
                item.insert(attr.clone(), value.clone());
            }
            UpdateAction::Add(attr, amount) => {
                let current = item.get(attr).and_then(Value::as_i64).unwrap_or(0);
                item.insert(attr.clone(), Value::from(current + amount));
            }
            UpdateAction::Remove(attr) => {
                item.remove(attr);
            }
        }
    }
}

/// One prepared single-row write, the unit of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedWrite {
    Put {
        item: Item,
        condition: Option<Condition>,
    },
    Update {
        key: Key,
        actions: Vec<UpdateAction>,
        condition: Option<Condition>,
    },
    Delete {
        key: Key,
        condition: Option<Condition>,
    },
}

impl PreparedWrite {
    /// Create a row, failing if one already exists under its key.
    pub fn put_if_absent(item: Item) -> Self {
        PreparedWrite::Put {
            item,
            condition: Some(Condition::NotExists),
        }
    }

    /// Update an existing row, failing if it is absent or `extra` is false.
    pub fn update_if_exists(key: Key, actions: Vec<UpdateAction>, extra: Option<Condition>) -> Self {
        let condition = match extra {
            Some(extra) => Condition::And(vec![Condition::Exists, extra]),
            None => Condition::Exists,
        };
        PreparedWrite::Update {
            key,
            actions,
            condition: Some(condition),
        }
    }

    /// Delete a row, failing unless the condition holds.
    pub fn delete_if(key: Key, condition: Condition) -> Self {
        PreparedWrite::Delete {
            key,
            condition: Some(condition),
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            PreparedWrite::Put { condition, .. }
            | PreparedWrite::Update { condition, .. }
            | PreparedWrite::Delete { condition, .. } => condition.as_ref(),
        }
    }
}

/// Sort-key restriction of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortCondition {
    Equals(String),
    BeginsWith(String),
}

impl SortCondition {
    pub fn matches(&self, sort: &str) -> bool {
        match self {
            SortCondition::Equals(expected) => sort == expected,
            SortCondition::BeginsWith(prefix) => sort.starts_with(prefix.as_str()),
        }
    }
}

/// Key-condition query against the table or one of its indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Index name, `None` for the table itself.
    pub index: Option<String>,
    /// Value of the (index) partition key.
    pub partition: String,
    pub sort: Option<SortCondition>,
    /// Attributes to return; all attributes when `None`.
    pub projection: Option<Vec<String>>,
    /// Page size.
    pub limit: Option<usize>,
    /// Ascending sort-key order when true.
    pub forward: bool,
}

impl Query {
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            index: None,
            partition: partition.into(),
            sort: None,
            projection: None,
            limit: None,
            forward: true,
        }
    }

    pub fn on_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn sort_equals(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(SortCondition::Equals(sort.into()));
        self
    }

    pub fn sort_begins_with(mut self, prefix: impl Into<String>) -> Self {
        self.sort = Some(SortCondition::BeginsWith(prefix.into()));
        self
    }

    pub fn project(mut self, attrs: &[&str]) -> Self {
        self.projection = Some(attrs.iter().map(|a| a.to_string()).collect());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.forward = false;
        self
    }
}

/// Opaque continuation token: the key attributes of the last returned row.
#[derive(Debug, Clone, PartialEq)]
pub struct PageToken(pub Item);

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    pub next: Option<PageToken>,
}

/// Interface to one table of the key-value store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Key attribute names and indexes of this table.
    fn schema(&self) -> &TableSchema;

    /// Fetch one row.
    async fn get(&self, key: &Key, consistent: bool) -> Result<Option<Item>>;

    /// Write a full row, optionally conditioned on the current one.
    async fn put(&self, item: Item, condition: Option<Condition>) -> Result<()>;

    /// Apply attribute mutations, returning the row as written.
    async fn update(
        &self,
        key: &Key,
        actions: Vec<UpdateAction>,
        condition: Option<Condition>,
    ) -> Result<Item>;

    /// Delete a row, returning the previous one if it existed.
    async fn delete(&self, key: &Key, condition: Option<Condition>) -> Result<Option<Item>>;

    /// Apply all writes atomically or none of them.
    ///
    /// On a condition failure the error is
    /// `StoreError::TransactionCanceled { index }` naming the first write whose
    /// condition did not hold.
    async fn transact_write(&self, writes: Vec<PreparedWrite>) -> Result<()>;

    /// Unconditional idempotent upserts, unordered, not atomic.
    async fn batch_put(&self, items: Vec<Item>) -> Result<()>;

    /// Unconditional deletes, unordered, not atomic.
    async fn batch_delete(&self, keys: Vec<Key>) -> Result<()>;

    /// Fetch one page of a query, resuming after `start` if given.
    async fn query_page(&self, query: &Query, start: Option<PageToken>) -> Result<Page>;

    /// Lazily stream every row matching the query, page by page.
    fn query_stream(&self, query: Query) -> BoxStream<'_, Result<Item>> {
        stream::try_unfold(
            (query, Some(None::<PageToken>)),
            move |(query, cursor)| async move {
                let Some(start) = cursor else {
                    return Ok::<_, StoreError>(None);
                };
                let page = self.query_page(&query, start).await?;
                let next = page.next.map(Some);
                let items = stream::iter(page.items.into_iter().map(Ok::<Item, StoreError>));
                Ok(Some((items, (query, next))))
            },
        )
        .try_flatten()
        .boxed()
    }
}

/// Handles to the two physical tables.
#[derive(Clone)]
pub struct Tables {
    /// Main entity table.
    pub main: Arc<dyn Store>,
    /// Feed projection table.
    pub feed: Arc<dyn Store>,
}

/// Initialize the store tables based on configuration.
pub async fn init_store(config: &StoreConfig) -> Result<Tables> {
    let timeout = Duration::from_millis(config.timeout_ms);
    info!(
        store = ?config.store_type,
        main = %config.table_name,
        feed = %config.feed_table_name,
        "Initializing store"
    );

    match config.store_type {
        StoreType::Memory => Ok(Tables {
            main: Arc::new(TimeoutStore::new(
                MemoryStore::new(TableSchema::main()),
                timeout,
            )),
            feed: Arc::new(TimeoutStore::new(
                MemoryStore::new(TableSchema::feed()),
                timeout,
            )),
        }),
        #[cfg(feature = "dynamo")]
        StoreType::Dynamo => {
            let endpoint = config.endpoint_url.as_deref();
            let main =
                DynamoStore::connect(&config.table_name, TableSchema::main(), endpoint).await?;
            let feed =
                DynamoStore::connect(&config.feed_table_name, TableSchema::feed(), endpoint)
                    .await?;
            Ok(Tables {
                main: Arc::new(TimeoutStore::new(main, timeout)),
                feed: Arc::new(TimeoutStore::new(feed, timeout)),
            })
        }
        #[cfg(not(feature = "dynamo"))]
        StoreType::Dynamo => {
            tracing::error!("DynamoDB store requested but 'dynamo' feature is not enabled");
            Err(StoreError::Validation(
                "DynamoDB feature not enabled".to_string(),
            ))
        }
    }
}
