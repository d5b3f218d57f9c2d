//! In-memory store implementation.
//!
//! Honors the full [`Store`] contract: conditional writes, atomic
//! transactions, sparse secondary indexes and pagination. Optionally records
//! a change feed of committed writes so the postprocessor can be driven
//! without an external stream.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    ChangeRecord, Condition, Item, Key, Page, PageToken, PreparedWrite, Query, Result, Store,
    StoreError, TableSchema, UpdateAction,
};

/// Hard transaction size limit, matching DynamoDB.
pub const MAX_TRANSACT_ITEMS: usize = 100;

/// Page size when the query does not set one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<Key, Item>,
    changes: Option<Vec<ChangeRecord>>,
}

impl MemoryState {
    /// Replace the row under `key`, recording the change if enabled.
    fn write(&mut self, key: &Key, new: Option<Item>) -> Option<Item> {
        let old = match &new {
            Some(item) => self.rows.insert(key.clone(), item.clone()),
            None => self.rows.remove(key),
        };
        if old.is_none() && new.is_none() {
            return None;
        }
        if let Some(changes) = self.changes.as_mut() {
            changes.push(ChangeRecord::new(
                key.partition.clone(),
                key.sort.clone(),
                old.clone(),
                new,
            ));
        }
        old
    }

    fn check(&self, key: &Key, condition: Option<&Condition>) -> Result<()> {
        match condition {
            Some(condition) if !condition.evaluate(self.rows.get(key)) => {
                Err(StoreError::ConditionFailed {
                    partition: key.partition.clone(),
                    sort: key.sort.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// In-memory implementation of one table.
pub struct MemoryStore {
    schema: TableSchema,
    state: RwLock<MemoryState>,
    unavailable: RwLock<bool>,
}

impl MemoryStore {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            state: RwLock::new(MemoryState::default()),
            unavailable: RwLock::new(false),
        }
    }

    /// Create a store that records every committed write as a [`ChangeRecord`].
    pub fn with_change_feed(schema: TableSchema) -> Self {
        Self {
            schema,
            state: RwLock::new(MemoryState {
                rows: BTreeMap::new(),
                changes: Some(Vec::new()),
            }),
            unavailable: RwLock::new(false),
        }
    }

    /// Take the change records recorded since the last drain.
    pub async fn drain_changes(&self) -> Vec<ChangeRecord> {
        self.state
            .write()
            .await
            .changes
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Make every call fail with `StoreError::Unavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    /// Number of rows currently stored.
    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All rows, in key order.
    pub async fn rows(&self) -> Vec<Item> {
        self.state.read().await.rows.values().cloned().collect()
    }

    async fn ensure_available(&self) -> Result<()> {
        if *self.unavailable.read().await {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn key_of(&self, item: &Item) -> Result<Key> {
        self.schema.key_of(item).ok_or_else(|| {
            StoreError::Validation(format!(
                "item is missing string key attributes `{}`/`{}`",
                self.schema.partition_key, self.schema.sort_key
            ))
        })
    }

    fn updated(&self, key: &Key, current: Option<&Item>, actions: &[UpdateAction]) -> Item {
        let mut item = current
            .cloned()
            .unwrap_or_else(|| self.schema.key_item(key));
        for action in actions {
            action.apply(&mut item);
        }
        item
    }

    fn write_key(&self, write: &PreparedWrite) -> Result<Key> {
        match write {
            PreparedWrite::Put { item, .. } => self.key_of(item),
            PreparedWrite::Update { key, .. } | PreparedWrite::Delete { key, .. } => {
                Ok(key.clone())
            }
        }
    }

    fn project(item: &Item, projection: Option<&Vec<String>>) -> Item {
        match projection {
            Some(attrs) => item
                .iter()
                .filter(|(name, _)| attrs.contains(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            None => item.clone(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn get(&self, key: &Key, _consistent: bool) -> Result<Option<Item>> {
        self.ensure_available().await?;
        Ok(self.state.read().await.rows.get(key).cloned())
    }

    async fn put(&self, item: Item, condition: Option<Condition>) -> Result<()> {
        self.ensure_available().await?;
        let key = self.key_of(&item)?;
        let mut state = self.state.write().await;
        state.check(&key, condition.as_ref())?;
        state.write(&key, Some(item));
        Ok(())
    }

    async fn update(
        &self,
        key: &Key,
        actions: Vec<UpdateAction>,
        condition: Option<Condition>,
    ) -> Result<Item> {
        self.ensure_available().await?;
        let mut state = self.state.write().await;
        state.check(key, condition.as_ref())?;
        let item = self.updated(key, state.rows.get(key), &actions);
        state.write(key, Some(item.clone()));
        Ok(item)
    }

    async fn delete(&self, key: &Key, condition: Option<Condition>) -> Result<Option<Item>> {
        self.ensure_available().await?;
        let mut state = self.state.write().await;
        state.check(key, condition.as_ref())?;
        Ok(state.write(key, None))
    }

    async fn transact_write(&self, writes: Vec<PreparedWrite>) -> Result<()> {
        self.ensure_available().await?;
        if writes.len() > MAX_TRANSACT_ITEMS {
            return Err(StoreError::TooManyItems {
                count: writes.len(),
                max: MAX_TRANSACT_ITEMS,
            });
        }

        let keys = writes
            .iter()
            .map(|w| self.write_key(w))
            .collect::<Result<Vec<_>>>()?;
        let mut seen = HashSet::new();
        if let Some(dup) = keys.iter().find(|k| !seen.insert(*k)) {
            return Err(StoreError::Validation(format!(
                "transaction touches {} more than once",
                dup
            )));
        }

        let mut state = self.state.write().await;

        // All conditions are checked against the pre-transaction state.
        for (index, (write, key)) in writes.iter().zip(&keys).enumerate() {
            if let Some(condition) = write.condition() {
                if !condition.evaluate(state.rows.get(key)) {
                    return Err(StoreError::TransactionCanceled { index: Some(index) });
                }
            }
        }

        for (write, key) in writes.into_iter().zip(&keys) {
            match write {
                PreparedWrite::Put { item, .. } => {
                    state.write(key, Some(item));
                }
                PreparedWrite::Update { actions, .. } => {
                    let item = self.updated(key, state.rows.get(key), &actions);
                    state.write(key, Some(item));
                }
                PreparedWrite::Delete { .. } => {
                    state.write(key, None);
                }
            }
        }
        Ok(())
    }

    async fn batch_put(&self, items: Vec<Item>) -> Result<()> {
        self.ensure_available().await?;
        let keyed = items
            .into_iter()
            .map(|item| Ok((self.key_of(&item)?, item)))
            .collect::<Result<Vec<_>>>()?;
        let mut state = self.state.write().await;
        for (key, item) in keyed {
            state.write(&key, Some(item));
        }
        Ok(())
    }

    async fn batch_delete(&self, keys: Vec<Key>) -> Result<()> {
        self.ensure_available().await?;
        let mut state = self.state.write().await;
        for key in keys {
            state.write(&key, None);
        }
        Ok(())
    }

    async fn query_page(&self, query: &Query, start: Option<PageToken>) -> Result<Page> {
        self.ensure_available().await?;
        let (pk_attr, sk_attr, index) = match &query.index {
            None => (&self.schema.partition_key, &self.schema.sort_key, None),
            Some(name) => {
                let index = self.schema.index(name).ok_or_else(|| {
                    StoreError::Validation(format!("table has no index `{}`", name))
                })?;
                (&index.partition_key, &index.sort_key, Some(index))
            }
        };

        let state = self.state.read().await;
        let mut matches: Vec<(String, &Key, &Item)> = state
            .rows
            .iter()
            .filter_map(|(key, item)| {
                let pk = item.get(pk_attr)?.as_str()?;
                let sk = item.get(sk_attr)?.as_str()?;
                let sort_ok = query.sort.as_ref().map_or(true, |c| c.matches(sk));
                (pk == query.partition && sort_ok).then(|| (sk.to_string(), key, item))
            })
            .collect();
        matches.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        if !query.forward {
            matches.reverse();
        }

        if let Some(PageToken(token)) = start {
            let cursor_sort = token
                .get(sk_attr)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let cursor_key = self.key_of(&token)?;
            let forward = query.forward;
            matches.retain(|(sk, key, _)| {
                let position = (sk, *key).cmp(&(&cursor_sort, &cursor_key));
                if forward {
                    position.is_gt()
                } else {
                    position.is_lt()
                }
            });
        }

        let page_size = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let has_more = matches.len() > page_size;
        matches.truncate(page_size);

        let next = match (has_more, matches.last()) {
            (true, Some((_, key, item))) => {
                let mut token = self.schema.key_item(key);
                if let Some(index) = index {
                    for attr in [&index.partition_key, &index.sort_key] {
                        if let Some(value) = item.get(attr) {
                            token.insert(attr.clone(), value.clone());
                        }
                    }
                }
                Some(PageToken(token))
            }
            _ => None,
        };

        let items = matches
            .into_iter()
            .map(|(_, _, item)| Self::project(item, query.projection.as_ref()))
            .collect();
        Ok(Page { items, next })
    }
}

#[cfg(test)]
mod tests;
