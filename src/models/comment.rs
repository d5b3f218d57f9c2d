//! Comments on posts.
//!
//! A comment and its post's `commentCount` always change in one
//! transaction. View rows of a deleted comment are removed afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::post::PostRepository;
use crate::models::view::{ViewRepository, Viewable};
use crate::storage::helpers::{from_item, keyed_item, timestamp, ts};
use crate::storage::schema::GSI_A1;
use crate::storage::{Condition, Key, PreparedWrite, Query, Store, StoreError};
use crate::transact::{TransactFailure, TransactPlan, TransactionCoordinator};

pub type Result<T> = std::result::Result<T, CommentError>;

#[derive(Debug, thiserror::Error)]
pub enum CommentError {
    #[error("Post `{0}` does not exist")]
    PostNotFound(String),

    #[error("Unable to add comment with id `{0}`... id already used?")]
    CommentIdUsed(String),

    #[error("Comment `{0}` does not exist")]
    CommentNotFound(String),

    #[error("User `{user_id}` is not authorized to delete comment `{comment_id}`")]
    NotAuthorized { user_id: String, comment_id: String },

    #[error(transparent)]
    Transaction(#[from] TransactFailure),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `comment/<id>` | `-`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRow {
    pub comment_id: String,
    pub post_id: String,
    pub user_id: String,
    pub text: String,
    #[serde(with = "ts")]
    pub commented_at: DateTime<Utc>,
    /// `comment/<postId>`
    pub gsi_a1_partition_key: String,
    pub gsi_a1_sort_key: String,
}

#[derive(Clone)]
pub struct CommentRepository {
    store: Arc<dyn Store>,
}

impl CommentRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn key(comment_id: &str) -> Key {
        Key::new(format!("comment/{}", comment_id), "-")
    }

    pub async fn get_comment(
        &self,
        comment_id: &str,
        consistent: bool,
    ) -> crate::storage::Result<Option<CommentRow>> {
        self.store
            .get(&Self::key(comment_id), consistent)
            .await?
            .map(from_item)
            .transpose()
    }

    pub fn transact_add(row: &CommentRow) -> crate::storage::Result<PreparedWrite> {
        Ok(PreparedWrite::put_if_absent(keyed_item(
            &Self::key(&row.comment_id),
            row,
        )?))
    }

    pub fn transact_delete(comment_id: &str) -> PreparedWrite {
        PreparedWrite::delete_if(Self::key(comment_id), Condition::Exists)
    }

    /// Comments on a post, oldest first.
    pub fn comments_by_post(
        &self,
        post_id: &str,
    ) -> BoxStream<'_, crate::storage::Result<CommentRow>> {
        let query = Query::partition(format!("comment/{}", post_id)).on_index(GSI_A1);
        self.store
            .query_stream(query)
            .and_then(|item| futures::future::ready(from_item(item)))
            .boxed()
    }
}

pub struct CommentManager {
    comments: CommentRepository,
    posts: PostRepository,
    views: ViewRepository,
    coordinator: TransactionCoordinator,
}

impl CommentManager {
    pub fn new(
        comments: CommentRepository,
        posts: PostRepository,
        views: ViewRepository,
        coordinator: TransactionCoordinator,
    ) -> Self {
        Self {
            comments,
            posts,
            views,
            coordinator,
        }
    }

    pub fn comments(&self) -> &CommentRepository {
        &self.comments
    }

    pub async fn get_comment(self: &Arc<Self>, comment_id: &str) -> Result<Option<Comment>> {
        Ok(self
            .comments
            .get_comment(comment_id, false)
            .await?
            .map(|row| Comment::new(row, self.clone())))
    }

    /// Add a comment and bump the post's comment count atomically.
    pub async fn add_comment(
        self: &Arc<Self>,
        comment_id: &str,
        post_id: &str,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Comment> {
        let row = CommentRow {
            comment_id: comment_id.to_string(),
            post_id: post_id.to_string(),
            user_id: user_id.to_string(),
            text: text.to_string(),
            commented_at: now,
            gsi_a1_partition_key: format!("comment/{}", post_id),
            gsi_a1_sort_key: timestamp(now),
        };

        let plan = TransactPlan::new()
            .with(
                CommentRepository::transact_add(&row)?,
                Some(CommentError::CommentIdUsed(comment_id.to_string())),
            )
            .with(
                PostRepository::transact_increment_comment_count(post_id),
                Some(CommentError::PostNotFound(post_id.to_string())),
            );
        self.coordinator
            .commit(plan)
            .await
            .map_err(|e| e.into_domain())?;

        debug!(comment_id, post_id, "Comment added");
        Ok(Comment::new(row, self.clone()))
    }
}

/// A comment bound to its manager.
pub struct Comment {
    pub row: CommentRow,
    manager: Arc<CommentManager>,
}

impl Comment {
    fn new(row: CommentRow, manager: Arc<CommentManager>) -> Self {
        Self { row, manager }
    }

    pub fn id(&self) -> &str {
        &self.row.comment_id
    }

    /// Delete the comment. `deleter_user_id` of `None` skips the permission
    /// check; otherwise only the comment's author or the post's author may
    /// delete it.
    pub async fn delete(&self, deleter_user_id: Option<&str>) -> Result<()> {
        let post = self
            .manager
            .posts
            .get_post(&self.row.post_id)
            .await?
            .ok_or_else(|| CommentError::PostNotFound(self.row.post_id.clone()))?;

        if let Some(deleter) = deleter_user_id {
            if deleter != post.posted_by_user_id && deleter != self.row.user_id {
                return Err(CommentError::NotAuthorized {
                    user_id: deleter.to_string(),
                    comment_id: self.row.comment_id.clone(),
                });
            }
        }

        let plan = TransactPlan::new()
            .with(
                CommentRepository::transact_delete(&self.row.comment_id),
                Some(CommentError::CommentNotFound(self.row.comment_id.clone())),
            )
            .with(
                PostRepository::transact_decrement_comment_count(&self.row.post_id),
                None,
            );
        self.manager
            .coordinator
            .commit(plan)
            .await
            .map_err(|e| e.into_domain())?;

        let deleted = self.manager.views.delete_views(&self.view_partition()).await?;
        debug!(comment_id = %self.row.comment_id, views = deleted, "Comment deleted");
        Ok(())
    }
}

#[async_trait]
impl Viewable for Comment {
    fn view_partition(&self) -> String {
        CommentRepository::key(&self.row.comment_id).partition
    }

    fn owner_user_id(&self) -> Option<&str> {
        Some(&self.row.user_id)
    }

    fn views(&self) -> &ViewRepository {
        &self.manager.views
    }
}
