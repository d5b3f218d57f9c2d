//! User profile rows and their chat counters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::counter::{self, CounterMode, CounterOutcome, CounterStore};
use crate::storage::helpers::{from_item, keyed_item, ts};
use crate::storage::{Condition, Key, PreparedWrite, Result, Store};

pub const CHAT_COUNT: &str = "chatCount";
pub const CHATS_WITH_UNVIEWED_MESSAGES_COUNT: &str = "chatsWithUnviewedMessagesCount";

/// `user/<id>` | `profile`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub username: String,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub chat_count: i64,
    #[serde(default)]
    pub chats_with_unviewed_messages_count: i64,
}

impl User {
    /// `@username`, as used in system messages.
    pub fn mention(&self) -> String {
        format!("@{}", self.username)
    }
}

#[derive(Clone)]
pub struct UserRepository {
    store: Arc<dyn Store>,
    counters: CounterStore,
}

impl UserRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let counters = CounterStore::new(store.clone());
        Self { store, counters }
    }

    pub fn key(user_id: &str) -> Key {
        Key::new(format!("user/{}", user_id), "profile")
    }

    /// Create a profile row, failing if the id is taken.
    pub async fn add_user(
        &self,
        user_id: &str,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let user = User {
            user_id: user_id.to_string(),
            username: username.to_string(),
            created_at: now,
            chat_count: 0,
            chats_with_unviewed_messages_count: 0,
        };
        let item = keyed_item(&Self::key(user_id), &user)?;
        self.store.put(item, Some(Condition::NotExists)).await?;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        self.get_user_with(user_id, false).await
    }

    pub async fn get_user_with(&self, user_id: &str, consistent: bool) -> Result<Option<User>> {
        self.store
            .get(&Self::key(user_id), consistent)
            .await?
            .map(from_item)
            .transpose()
    }

    pub fn transact_increment_chat_count(user_id: &str) -> PreparedWrite {
        CounterStore::transact_increment(Self::key(user_id), CHAT_COUNT, 1)
    }

    pub fn transact_decrement_chat_count(user_id: &str) -> PreparedWrite {
        CounterStore::transact_decrement(Self::key(user_id), CHAT_COUNT, 1)
    }

    pub async fn increment_chats_with_unviewed_messages_count(
        &self,
        user_id: &str,
        mode: CounterMode,
    ) -> counter::Result<CounterOutcome> {
        self.counters
            .increment(&Self::key(user_id), CHATS_WITH_UNVIEWED_MESSAGES_COUNT, 1, mode)
            .await
    }

    pub async fn decrement_chats_with_unviewed_messages_count(
        &self,
        user_id: &str,
        mode: CounterMode,
    ) -> counter::Result<CounterOutcome> {
        self.counters
            .decrement(&Self::key(user_id), CHATS_WITH_UNVIEWED_MESSAGES_COUNT, 1, mode)
            .await
    }
}
