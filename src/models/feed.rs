//! Feed fan-out.
//!
//! A feed entry exists in two projections that are written and deleted as a
//! pair:
//!
//! - main table: `post/<postId>` | `feed/<feedUserId>`, indexed by time on
//!   `GSI-A1` and by author on `GSI-A2` (both partitioned `feed/<feedUserId>`)
//! - feed table: `postId` / `feedUserId`, indexed by `postedAt` and
//!   `postedByUserId`
//!
//! Writes are idempotent upserts, so partial fan-out can be re-run. Every
//! mutation of the main projection is immediately followed by the matching
//! mutation of the feed table; the main projection is the ground truth when
//! repairing a pair that a crash left half-written.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::post::Post;
use crate::storage::helpers::{from_item, key_id, keyed_item, timestamp, to_item, ts};
use crate::storage::schema::{GSI_A1, GSI_A2, PARTITION_KEY, SORT_KEY};
use crate::storage::{Item, Key, Query, Store, StoreError};

pub const FEED_SCHEMA_VERSION: i64 = 3;

pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed row {0} is malformed")]
    MalformedRow(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Feed-table projection of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    pub post_id: String,
    pub feed_user_id: String,
    pub posted_by_user_id: String,
    #[serde(with = "ts")]
    pub posted_at: DateTime<Utc>,
}

/// Main-table projection of one entry, less its key.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedRow {
    schema_version: i64,
    gsi_a1_partition_key: String,
    gsi_a1_sort_key: String,
    gsi_a2_partition_key: String,
    gsi_a2_sort_key: String,
}

pub struct FeedEngine {
    main: Arc<dyn Store>,
    feed: Arc<dyn Store>,
    batch_size: usize,
}

impl FeedEngine {
    pub fn new(main: Arc<dyn Store>, feed: Arc<dyn Store>, batch_size: usize) -> Self {
        Self {
            main,
            feed,
            batch_size: batch_size.max(1),
        }
    }

    pub fn key(feed_user_id: &str, post_id: &str) -> Key {
        Key::new(format!("post/{}", post_id), format!("feed/{}", feed_user_id))
    }

    fn feed_partition(feed_user_id: &str) -> String {
        format!("feed/{}", feed_user_id)
    }

    fn main_item(feed_user_id: &str, post: &Post) -> Result<Item> {
        let row = FeedRow {
            schema_version: FEED_SCHEMA_VERSION,
            gsi_a1_partition_key: Self::feed_partition(feed_user_id),
            gsi_a1_sort_key: timestamp(post.posted_at),
            gsi_a2_partition_key: Self::feed_partition(feed_user_id),
            gsi_a2_sort_key: post.posted_by_user_id.clone(),
        };
        Ok(keyed_item(&Self::key(feed_user_id, &post.post_id), &row)?)
    }

    fn feed_item(feed_user_id: &str, post: &Post) -> Result<Item> {
        Ok(to_item(&FeedEntry {
            post_id: post.post_id.clone(),
            feed_user_id: feed_user_id.to_string(),
            posted_by_user_id: post.posted_by_user_id.clone(),
            posted_at: post.posted_at,
        })?)
    }

    /// Add a post to the feeds of the given users. Returns the (deduplicated)
    /// user ids written.
    pub async fn fan_out_post<I>(&self, post: &Post, feed_user_ids: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = String>,
    {
        let mut seen = HashSet::new();
        let user_ids: Vec<String> = feed_user_ids
            .into_iter()
            .filter(|user_id| seen.insert(user_id.clone()))
            .collect();

        for chunk in user_ids.chunks(self.batch_size) {
            let main_items = chunk
                .iter()
                .map(|user_id| Self::main_item(user_id, post))
                .collect::<Result<Vec<_>>>()?;
            let feed_items = chunk
                .iter()
                .map(|user_id| Self::feed_item(user_id, post))
                .collect::<Result<Vec<_>>>()?;
            self.main.batch_put(main_items).await?;
            self.feed.batch_put(feed_items).await?;
        }

        debug!(post_id = %post.post_id, users = user_ids.len(), "Fanned out post");
        Ok(user_ids)
    }

    /// Add posts to one user's feed, e.g. after following their author.
    pub async fn fan_out_posts(&self, feed_user_id: &str, posts: &[Post]) -> Result<usize> {
        for chunk in posts.chunks(self.batch_size) {
            let main_items = chunk
                .iter()
                .map(|post| Self::main_item(feed_user_id, post))
                .collect::<Result<Vec<_>>>()?;
            let feed_items = chunk
                .iter()
                .map(|post| Self::feed_item(feed_user_id, post))
                .collect::<Result<Vec<_>>>()?;
            self.main.batch_put(main_items).await?;
            self.feed.batch_put(feed_items).await?;
        }
        Ok(posts.len())
    }

    /// Remove a post from every feed. Returns the affected user ids.
    pub async fn remove_by_post(&self, post_id: &str) -> Result<Vec<String>> {
        let main_keys = self
            .keys(
                &*self.main,
                Query::partition(format!("post/{}", post_id))
                    .sort_begins_with("feed/")
                    .project(&[PARTITION_KEY, SORT_KEY]),
            )
            .await?;
        let user_ids = main_keys
            .iter()
            .map(|key| {
                key_id(&key.sort)
                    .map(str::to_string)
                    .ok_or_else(|| FeedError::MalformedRow(key.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        self.delete_keys(&*self.main, main_keys).await?;

        let schema = self.feed.schema();
        let feed_keys = self
            .keys(
                &*self.feed,
                Query::partition(post_id)
                    .project(&[schema.partition_key.as_str(), schema.sort_key.as_str()]),
            )
            .await?;
        self.delete_keys(&*self.feed, feed_keys).await?;

        debug!(post_id, users = user_ids.len(), "Removed post from feeds");
        Ok(user_ids)
    }

    /// Remove every post by `posted_by_user_id` from the feed of
    /// `feed_user_id`. Returns the number of entries removed.
    pub async fn remove_by_author(
        &self,
        feed_user_id: &str,
        posted_by_user_id: &str,
    ) -> Result<usize> {
        let main_keys = self
            .keys(
                &*self.main,
                Query::partition(Self::feed_partition(feed_user_id))
                    .on_index(GSI_A2)
                    .sort_equals(posted_by_user_id)
                    .project(&[PARTITION_KEY, SORT_KEY]),
            )
            .await?;
        let removed = main_keys.len();
        self.delete_keys(&*self.main, main_keys).await?;

        let schema = self.feed.schema();
        let feed_keys = self
            .keys(
                &*self.feed,
                Query::partition(feed_user_id)
                    .on_index(GSI_A2)
                    .sort_equals(posted_by_user_id)
                    .project(&[schema.partition_key.as_str(), schema.sort_key.as_str()]),
            )
            .await?;
        self.delete_keys(&*self.feed, feed_keys).await?;

        debug!(feed_user_id, posted_by_user_id, removed, "Removed author from feed");
        Ok(removed)
    }

    /// Post ids in a user's feed from the main projection, newest first.
    pub fn post_ids(&self, feed_user_id: &str) -> BoxStream<'_, Result<String>> {
        let query = Query::partition(Self::feed_partition(feed_user_id))
            .on_index(GSI_A1)
            .project(&[PARTITION_KEY])
            .descending();
        self.main
            .query_stream(query)
            .map_err(FeedError::from)
            .and_then(|item| {
                let post_id = item
                    .get(PARTITION_KEY)
                    .and_then(|v| v.as_str())
                    .and_then(key_id)
                    .map(str::to_string)
                    .ok_or_else(|| FeedError::MalformedRow(format!("{:?}", item)));
                futures::future::ready(post_id)
            })
            .boxed()
    }

    /// Entries of a user's feed from the feed table, newest first.
    pub fn entries(&self, feed_user_id: &str) -> BoxStream<'_, Result<FeedEntry>> {
        let query = Query::partition(feed_user_id).on_index(GSI_A1).descending();
        self.feed
            .query_stream(query)
            .map_err(FeedError::from)
            .and_then(|item| futures::future::ready(from_item(item).map_err(FeedError::from)))
            .boxed()
    }

    async fn keys(&self, store: &dyn Store, query: Query) -> Result<Vec<Key>> {
        let schema = store.schema().clone();
        let items: Vec<Item> = store.query_stream(query).try_collect().await?;
        items
            .iter()
            .map(|item| {
                schema
                    .key_of(item)
                    .ok_or_else(|| FeedError::MalformedRow(format!("{:?}", item)))
            })
            .collect()
    }

    async fn delete_keys(&self, store: &dyn Store, keys: Vec<Key>) -> Result<()> {
        for chunk in keys.chunks(self.batch_size) {
            store.batch_delete(chunk.to_vec()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::storage::{MemoryStore, TableSchema};

    fn post(post_id: &str, author: &str) -> Post {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        Post {
            post_id: post_id.to_string(),
            posted_by_user_id: author.to_string(),
            posted_at: at,
            text: None,
            comment_count: 0,
            gsi_a1_partition_key: format!("post/{}", author),
            gsi_a1_sort_key: timestamp(at),
        }
    }

    #[test]
    fn test_main_item_layout() {
        let item = FeedEngine::main_item("u2", &post("p1", "u1")).unwrap();
        assert_eq!(item.get("partitionKey"), Some(&"post/p1".into()));
        assert_eq!(item.get("sortKey"), Some(&"feed/u2".into()));
        assert_eq!(item.get("schemaVersion"), Some(&3.into()));
        assert_eq!(item.get("gsiA1PartitionKey"), Some(&"feed/u2".into()));
        assert_eq!(item.get("gsiA2SortKey"), Some(&"u1".into()));
    }

    #[tokio::test]
    async fn test_fan_out_deduplicates_targets() {
        let main = Arc::new(MemoryStore::new(TableSchema::main()));
        let feed = Arc::new(MemoryStore::new(TableSchema::feed()));
        let engine = FeedEngine::new(main.clone(), feed.clone(), 2);

        let written = engine
            .fan_out_post(
                &post("p1", "u1"),
                ["u2", "u3", "u2", "u4"].map(String::from),
            )
            .await
            .unwrap();
        assert_eq!(written, vec!["u2", "u3", "u4"]);
        assert_eq!(main.len().await, 3);
        assert_eq!(feed.len().await, 3);
    }
}
