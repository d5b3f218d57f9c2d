//! Blocking relationships.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::feed::{FeedEngine, FeedError};
use crate::storage::helpers::{from_item, keyed_item, timestamp, ts};
use crate::storage::{Condition, Key, Store, StoreError};

pub type Result<T> = std::result::Result<T, BlockError>;

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("User `{0}` cannot block themselves")]
    SelfBlock(String),

    #[error("User `{blocker_user_id}` has already blocked user `{blocked_user_id}`")]
    AlreadyBlocked {
        blocker_user_id: String,
        blocked_user_id: String,
    },

    #[error("User `{blocker_user_id}` has not blocked user `{blocked_user_id}`")]
    NotBlocked {
        blocker_user_id: String,
        blocked_user_id: String,
    },

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `block/<blockerUserId>/<blockedUserId>` | `-`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub blocker_user_id: String,
    pub blocked_user_id: String,
    #[serde(with = "ts")]
    pub blocked_at: DateTime<Utc>,
    /// `block/<blockerUserId>`
    pub gsi_a1_partition_key: String,
    pub gsi_a1_sort_key: String,
    /// `block/<blockedUserId>`
    pub gsi_a2_partition_key: String,
    pub gsi_a2_sort_key: String,
}

#[derive(Clone)]
pub struct BlockRepository {
    store: Arc<dyn Store>,
}

impl BlockRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn key(blocker_user_id: &str, blocked_user_id: &str) -> Key {
        Key::new(
            format!("block/{}/{}", blocker_user_id, blocked_user_id),
            "-",
        )
    }

    pub async fn get_block(
        &self,
        blocker_user_id: &str,
        blocked_user_id: &str,
    ) -> crate::storage::Result<Option<Block>> {
        self.store
            .get(&Self::key(blocker_user_id, blocked_user_id), false)
            .await?
            .map(from_item)
            .transpose()
    }

    /// Create the block row; a condition failure means it already exists.
    pub async fn add_block(
        &self,
        blocker_user_id: &str,
        blocked_user_id: &str,
        now: DateTime<Utc>,
    ) -> crate::storage::Result<Block> {
        let block = Block {
            blocker_user_id: blocker_user_id.to_string(),
            blocked_user_id: blocked_user_id.to_string(),
            blocked_at: now,
            gsi_a1_partition_key: format!("block/{}", blocker_user_id),
            gsi_a1_sort_key: timestamp(now),
            gsi_a2_partition_key: format!("block/{}", blocked_user_id),
            gsi_a2_sort_key: timestamp(now),
        };
        let item = keyed_item(&Self::key(blocker_user_id, blocked_user_id), &block)?;
        self.store.put(item, Some(Condition::NotExists)).await?;
        Ok(block)
    }

    pub async fn delete_block(
        &self,
        blocker_user_id: &str,
        blocked_user_id: &str,
    ) -> crate::storage::Result<Option<Block>> {
        self.store
            .delete(&Self::key(blocker_user_id, blocked_user_id), None)
            .await?
            .map(from_item)
            .transpose()
    }
}

pub struct BlockManager {
    blocks: BlockRepository,
    feed: Arc<FeedEngine>,
}

impl BlockManager {
    pub fn new(blocks: BlockRepository, feed: Arc<FeedEngine>) -> Self {
        Self { blocks, feed }
    }

    pub async fn is_blocked(&self, blocker_user_id: &str, blocked_user_id: &str) -> Result<bool> {
        Ok(self
            .blocks
            .get_block(blocker_user_id, blocked_user_id)
            .await?
            .is_some())
    }

    /// Block a user and remove each user's posts from the other's feed.
    pub async fn block(
        &self,
        blocker_user_id: &str,
        blocked_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Block> {
        if blocker_user_id == blocked_user_id {
            return Err(BlockError::SelfBlock(blocker_user_id.to_string()));
        }

        let block = match self
            .blocks
            .add_block(blocker_user_id, blocked_user_id, now)
            .await
        {
            Ok(block) => block,
            Err(StoreError::ConditionFailed { .. }) => {
                return Err(BlockError::AlreadyBlocked {
                    blocker_user_id: blocker_user_id.to_string(),
                    blocked_user_id: blocked_user_id.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        self.feed
            .remove_by_author(blocker_user_id, blocked_user_id)
            .await?;
        self.feed
            .remove_by_author(blocked_user_id, blocker_user_id)
            .await?;

        info!(blocker_user_id, blocked_user_id, "User blocked");
        Ok(block)
    }

    pub async fn unblock(&self, blocker_user_id: &str, blocked_user_id: &str) -> Result<Block> {
        self.blocks
            .delete_block(blocker_user_id, blocked_user_id)
            .await?
            .ok_or_else(|| BlockError::NotBlocked {
                blocker_user_id: blocker_user_id.to_string(),
                blocked_user_id: blocked_user_id.to_string(),
            })
    }
}
