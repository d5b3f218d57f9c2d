//! Post rows.
//!
//! Only the attributes the feed and comment counters depend on are modelled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::counter::CounterStore;
use crate::storage::helpers::{from_item, keyed_item, timestamp, ts};
use crate::storage::schema::GSI_A1;
use crate::storage::{Condition, Key, PreparedWrite, Query, Result, Store};

pub const COMMENT_COUNT: &str = "commentCount";

/// `post/<id>` | `-`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub post_id: String,
    pub posted_by_user_id: String,
    #[serde(with = "ts")]
    pub posted_at: DateTime<Utc>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub comment_count: i64,
    /// `post/<postedByUserId>`
    pub gsi_a1_partition_key: String,
    /// Posted-at timestamp.
    pub gsi_a1_sort_key: String,
}

#[derive(Clone)]
pub struct PostRepository {
    store: Arc<dyn Store>,
}

impl PostRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn key(post_id: &str) -> Key {
        Key::new(format!("post/{}", post_id), "-")
    }

    pub async fn add_post(
        &self,
        post_id: &str,
        posted_by_user_id: &str,
        text: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Post> {
        let post = Post {
            post_id: post_id.to_string(),
            posted_by_user_id: posted_by_user_id.to_string(),
            posted_at: now,
            text: text.map(str::to_string),
            comment_count: 0,
            gsi_a1_partition_key: format!("post/{}", posted_by_user_id),
            gsi_a1_sort_key: timestamp(now),
        };
        let item = keyed_item(&Self::key(post_id), &post)?;
        self.store.put(item, Some(Condition::NotExists)).await?;
        Ok(post)
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        self.store
            .get(&Self::key(post_id), false)
            .await?
            .map(from_item)
            .transpose()
    }

    /// Every post of a user, oldest first.
    pub fn posts_by_user(&self, user_id: &str) -> BoxStream<'_, Result<Post>> {
        let query = Query::partition(format!("post/{}", user_id)).on_index(GSI_A1);
        self.store
            .query_stream(query)
            .and_then(|item| futures::future::ready(from_item(item)))
            .boxed()
    }

    pub fn transact_increment_comment_count(post_id: &str) -> PreparedWrite {
        CounterStore::transact_increment(Self::key(post_id), COMMENT_COUNT, 1)
    }

    pub fn transact_decrement_comment_count(post_id: &str) -> PreparedWrite {
        CounterStore::transact_decrement(Self::key(post_id), COMMENT_COUNT, 1)
    }
}
