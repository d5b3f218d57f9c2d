//! View tracking.
//!
//! A view is a `view/<userId>` row stored under the partition of the viewed
//! entity. The [`Viewable`] capability gives any entity viewed-status and
//! view-recording on top of a [`ViewRepository`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::storage::helpers::{from_item, key_id, keyed_item, timestamp, ts};
use crate::storage::schema::{PARTITION_KEY, SORT_KEY};
use crate::storage::{Condition, Key, Query, Result, Store, StoreError, UpdateAction};

pub const VIEW_PREFIX: &str = "view/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewedStatus {
    NotViewed,
    Viewed,
}

/// `<entity partition>` | `view/<userId>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    #[serde(rename = "partitionKey")]
    pub partition: String,
    #[serde(rename = "sortKey")]
    pub sort: String,
    pub view_count: i64,
    #[serde(with = "ts")]
    pub first_viewed_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub last_viewed_at: DateTime<Utc>,
    /// Set on chat message views so they can be reconciled without the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl View {
    pub fn user_id(&self) -> Option<&str> {
        key_id(&self.sort)
    }
}

#[derive(Clone)]
pub struct ViewRepository {
    store: Arc<dyn Store>,
}

impl ViewRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn key(partition: &str, user_id: &str) -> Key {
        Key::new(partition, format!("{}{}", VIEW_PREFIX, user_id))
    }

    pub async fn get_view(&self, partition: &str, user_id: &str) -> Result<Option<View>> {
        self.store
            .get(&Self::key(partition, user_id), false)
            .await?
            .map(from_item)
            .transpose()
    }

    /// Create the view row or add to its count. `lastViewedAt` only moves
    /// forward.
    pub async fn record_view(
        &self,
        partition: &str,
        user_id: &str,
        view_count: i64,
        viewed_at: DateTime<Utc>,
    ) -> Result<View> {
        self.record(partition, user_id, None, view_count, viewed_at)
            .await
    }

    /// Record a view of a chat message, stamping the row with its chat.
    pub async fn record_chat_message_view(
        &self,
        partition: &str,
        chat_id: &str,
        user_id: &str,
        view_count: i64,
        viewed_at: DateTime<Utc>,
    ) -> Result<View> {
        self.record(partition, user_id, Some(chat_id), view_count, viewed_at)
            .await
    }

    async fn record(
        &self,
        partition: &str,
        user_id: &str,
        chat_id: Option<&str>,
        view_count: i64,
        viewed_at: DateTime<Utc>,
    ) -> Result<View> {
        let key = Self::key(partition, user_id);
        let view = View {
            partition: key.partition.clone(),
            sort: key.sort.clone(),
            view_count,
            first_viewed_at: viewed_at,
            last_viewed_at: viewed_at,
            chat_id: chat_id.map(str::to_string),
        };
        match self
            .store
            .put(keyed_item(&key, &view)?, Some(Condition::NotExists))
            .await
        {
            Ok(()) => return Ok(view),
            Err(StoreError::ConditionFailed { .. }) => {}
            Err(e) => return Err(e),
        }

        let item = self
            .store
            .update(
                &key,
                vec![UpdateAction::add("viewCount", view_count)],
                Some(Condition::Exists),
            )
            .await?;
        let last_viewed_at = timestamp(viewed_at);
        match self
            .store
            .update(
                &key,
                vec![UpdateAction::set("lastViewedAt", last_viewed_at.clone())],
                Some(Condition::And(vec![
                    Condition::Exists,
                    Condition::missing_or_before("lastViewedAt", last_viewed_at),
                ])),
            )
            .await
        {
            Ok(item) => from_item(item),
            Err(StoreError::ConditionFailed { .. }) => from_item(item),
            Err(e) => Err(e),
        }
    }

    /// Delete one view row, reporting whether it existed.
    pub async fn delete_view(&self, partition: &str, user_id: &str) -> Result<bool> {
        Ok(self
            .store
            .delete(&Self::key(partition, user_id), None)
            .await?
            .is_some())
    }

    /// Delete every view row under a partition.
    pub async fn delete_views(&self, partition: &str) -> Result<usize> {
        let keys = self.view_keys(partition).await?;
        let count = keys.len();
        if count > 0 {
            self.store.batch_delete(keys).await?;
        }
        Ok(count)
    }

    /// Keys of every view row under a partition.
    pub async fn view_keys(&self, partition: &str) -> Result<Vec<Key>> {
        let query = Query::partition(partition)
            .sort_begins_with(VIEW_PREFIX)
            .project(&[PARTITION_KEY, SORT_KEY]);
        let schema = self.store.schema().clone();
        self.store
            .query_stream(query)
            .try_filter_map(|item| futures::future::ready(Ok(schema.key_of(&item))))
            .try_collect()
            .await
    }
}

/// View capability shared by chats, comments and chat messages.
#[async_trait]
pub trait Viewable: Send + Sync {
    /// Partition key of the viewed entity.
    fn view_partition(&self) -> String;

    /// The owner always counts as having viewed.
    fn owner_user_id(&self) -> Option<&str>;

    fn views(&self) -> &ViewRepository;

    async fn get_viewed_status(&self, user_id: &str) -> Result<ViewedStatus> {
        if self.owner_user_id() == Some(user_id) {
            return Ok(ViewedStatus::Viewed);
        }
        let view = self.views().get_view(&self.view_partition(), user_id).await?;
        Ok(match view {
            Some(_) => ViewedStatus::Viewed,
            None => ViewedStatus::NotViewed,
        })
    }

    /// Record `view_count` views. Views by the owner are not recorded.
    async fn record_view(
        &self,
        user_id: &str,
        view_count: i64,
        viewed_at: DateTime<Utc>,
    ) -> Result<Option<View>> {
        if self.owner_user_id() == Some(user_id) {
            return Ok(None);
        }
        self.views()
            .record_view(&self.view_partition(), user_id, view_count, viewed_at)
            .await
            .map(Some)
    }
}
