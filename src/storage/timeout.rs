//! Per-call timeout decorator.
//!
//! Every store call is a suspension point; callers must never wait on one
//! unboundedly. Expired calls surface as `StoreError::Timeout`, an
//! infrastructure error distinct from condition failures.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{
    Condition, Item, Key, Page, PageToken, PreparedWrite, Query, Result, Store, StoreError,
    TableSchema, UpdateAction,
};

/// Store wrapper bounding every call with a timeout.
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: Store> TimeoutStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout = ?self.timeout, "Store call timed out");
                Err(StoreError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl<S: Store> Store for TimeoutStore<S> {
    fn schema(&self) -> &TableSchema {
        self.inner.schema()
    }

    async fn get(&self, key: &Key, consistent: bool) -> Result<Option<Item>> {
        self.bounded("get", self.inner.get(key, consistent)).await
    }

    async fn put(&self, item: Item, condition: Option<Condition>) -> Result<()> {
        self.bounded("put", self.inner.put(item, condition)).await
    }

    async fn update(
        &self,
        key: &Key,
        actions: Vec<UpdateAction>,
        condition: Option<Condition>,
    ) -> Result<Item> {
        self.bounded("update", self.inner.update(key, actions, condition))
            .await
    }

    async fn delete(&self, key: &Key, condition: Option<Condition>) -> Result<Option<Item>> {
        self.bounded("delete", self.inner.delete(key, condition)).await
    }

    async fn transact_write(&self, writes: Vec<PreparedWrite>) -> Result<()> {
        self.bounded("transact_write", self.inner.transact_write(writes))
            .await
    }

    async fn batch_put(&self, items: Vec<Item>) -> Result<()> {
        self.bounded("batch_put", self.inner.batch_put(items)).await
    }

    async fn batch_delete(&self, keys: Vec<Key>) -> Result<()> {
        self.bounded("batch_delete", self.inner.batch_delete(keys))
            .await
    }

    async fn query_page(&self, query: &Query, start: Option<PageToken>) -> Result<Page> {
        self.bounded("query", self.inner.query_page(query, start))
            .await
    }
}
