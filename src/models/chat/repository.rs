//! Chat and chat-member rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use super::ChatType;
use crate::counter::{self, CounterMode, CounterOutcome, CounterStore};
use crate::storage::helpers::{from_item, key_id, keyed_item, timestamp, ts};
use crate::storage::schema::{GSI_A1, GSI_K1, GSI_K1_SORT_KEY, PARTITION_KEY, SORT_KEY};
use crate::storage::{
    Condition, Item, Key, PreparedWrite, Query, Result, Store, StoreError, UpdateAction,
};

pub const USER_COUNT: &str = "userCount";
pub const MESSAGES_COUNT: &str = "messagesCount";
pub const MESSAGES_UNVIEWED_COUNT: &str = "messagesUnviewedCount";
pub const LAST_MESSAGE_ACTIVITY_AT: &str = "lastMessageActivityAt";

const MEMBER_PREFIX: &str = "member/";

/// `chat/<id>` | `-`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRow {
    pub chat_id: String,
    pub chat_type: ChatType,
    pub created_by_user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub user_count: i64,
    #[serde(default)]
    pub messages_count: i64,
    #[serde(default, with = "ts::option")]
    pub last_message_activity_at: Option<DateTime<Utc>>,
    /// `chat/<lo user id>/<hi user id>`, direct chats only.
    #[serde(default)]
    pub gsi_a1_partition_key: Option<String>,
    #[serde(default)]
    pub gsi_a1_sort_key: Option<String>,
}

impl ChatRow {
    /// The two members of a direct chat.
    pub fn direct_user_ids(&self) -> Option<(&str, &str)> {
        let mut parts = self.gsi_a1_partition_key.as_deref()?.split('/').skip(1);
        Some((parts.next()?, parts.next()?))
    }
}

#[derive(Clone)]
pub struct ChatRepository {
    store: Arc<dyn Store>,
    counters: CounterStore,
}

impl ChatRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let counters = CounterStore::new(store.clone());
        Self { store, counters }
    }

    pub fn key(chat_id: &str) -> Key {
        Key::new(format!("chat/{}", chat_id), "-")
    }

    /// Index key shared by every direct chat between the same two users.
    pub fn direct_chat_partition(user_id_1: &str, user_id_2: &str) -> String {
        let (lo, hi) = if user_id_1 <= user_id_2 {
            (user_id_1, user_id_2)
        } else {
            (user_id_2, user_id_1)
        };
        format!("chat/{}/{}", lo, hi)
    }

    /// Row for a new chat with no members counted yet.
    pub fn new_row(
        chat_id: &str,
        chat_type: ChatType,
        created_by_user_id: &str,
        with_user_id: Option<&str>,
        name: Option<&str>,
        now: DateTime<Utc>,
    ) -> ChatRow {
        let user_count = match chat_type {
            ChatType::Direct => 2,
            ChatType::Group => 1,
        };
        ChatRow {
            chat_id: chat_id.to_string(),
            chat_type,
            created_by_user_id: created_by_user_id.to_string(),
            name: name.filter(|n| !n.is_empty()).map(str::to_string),
            created_at: now,
            user_count,
            messages_count: 0,
            last_message_activity_at: Some(now),
            gsi_a1_partition_key: with_user_id
                .map(|with| Self::direct_chat_partition(created_by_user_id, with)),
            gsi_a1_sort_key: with_user_id.map(|_| "-".to_string()),
        }
    }

    pub fn transact_add(row: &ChatRow) -> Result<PreparedWrite> {
        Ok(PreparedWrite::put_if_absent(keyed_item(
            &Self::key(&row.chat_id),
            row,
        )?))
    }

    /// Delete the chat only if it has exactly `expected_user_count` members.
    pub fn transact_delete(chat_id: &str, expected_user_count: i64) -> PreparedWrite {
        PreparedWrite::delete_if(
            Self::key(chat_id),
            Condition::equals(USER_COUNT, expected_user_count),
        )
    }

    pub fn transact_increment_user_count(chat_id: &str) -> PreparedWrite {
        CounterStore::transact_increment(Self::key(chat_id), USER_COUNT, 1)
    }

    pub fn transact_decrement_user_count(chat_id: &str) -> PreparedWrite {
        CounterStore::transact_decrement(Self::key(chat_id), USER_COUNT, 1)
    }

    pub async fn get(&self, chat_id: &str, consistent: bool) -> Result<Option<ChatRow>> {
        self.store
            .get(&Self::key(chat_id), consistent)
            .await?
            .map(from_item)
            .transpose()
    }

    pub async fn get_direct_chat(
        &self,
        user_id_1: &str,
        user_id_2: &str,
    ) -> Result<Option<ChatRow>> {
        let query = Query::partition(Self::direct_chat_partition(user_id_1, user_id_2))
            .on_index(GSI_A1)
            .limit(1);
        let page = self.store.query_page(&query, None).await?;
        page.items.into_iter().next().map(from_item).transpose()
    }

    /// Set the name, or remove it when empty.
    pub async fn update_name(&self, chat_id: &str, name: &str) -> Result<ChatRow> {
        let action = if name.is_empty() {
            UpdateAction::Remove("name".to_string())
        } else {
            UpdateAction::set("name", name)
        };
        let item = self
            .store
            .update(&Self::key(chat_id), vec![action], Some(Condition::Exists))
            .await?;
        from_item(item)
    }

    pub async fn increment_messages_count(
        &self,
        chat_id: &str,
        mode: CounterMode,
    ) -> counter::Result<CounterOutcome> {
        self.counters
            .increment(&Self::key(chat_id), MESSAGES_COUNT, 1, mode)
            .await
    }

    pub async fn decrement_messages_count(
        &self,
        chat_id: &str,
        mode: CounterMode,
    ) -> counter::Result<CounterOutcome> {
        self.counters
            .decrement(&Self::key(chat_id), MESSAGES_COUNT, 1, mode)
            .await
    }

    /// Move the activity timestamp forward; never backwards.
    pub async fn update_last_message_activity_at(
        &self,
        chat_id: &str,
        at: DateTime<Utc>,
        mode: CounterMode,
    ) -> counter::Result<CounterOutcome> {
        let at = timestamp(at);
        self.counters
            .apply(
                &Self::key(chat_id),
                vec![UpdateAction::set(LAST_MESSAGE_ACTIVITY_AT, at.clone())],
                Some(Condition::missing_or_before(LAST_MESSAGE_ACTIVITY_AT, at)),
                mode,
            )
            .await
    }
}

/// `chat/<chatId>` | `member/<userId>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMember {
    pub chat_id: String,
    pub user_id: String,
    #[serde(with = "ts")]
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub messages_unviewed_count: i64,
    #[serde(default, with = "ts::option")]
    pub last_message_activity_at: Option<DateTime<Utc>>,
    /// `member/<userId>`
    pub gsi_k1_partition_key: String,
    /// Last activity timestamp, so a user's chats sort by activity.
    pub gsi_k1_sort_key: String,
}

#[derive(Clone)]
pub struct ChatMemberRepository {
    store: Arc<dyn Store>,
    counters: CounterStore,
}

impl ChatMemberRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let counters = CounterStore::new(store.clone());
        Self { store, counters }
    }

    pub fn key(chat_id: &str, user_id: &str) -> Key {
        Key::new(
            format!("chat/{}", chat_id),
            format!("{}{}", MEMBER_PREFIX, user_id),
        )
    }

    /// Create the membership; fails the transaction if it already exists.
    pub fn transact_add(chat_id: &str, user_id: &str, now: DateTime<Utc>) -> Result<PreparedWrite> {
        let member = ChatMember {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            joined_at: now,
            messages_unviewed_count: 0,
            last_message_activity_at: Some(now),
            gsi_k1_partition_key: format!("{}{}", MEMBER_PREFIX, user_id),
            gsi_k1_sort_key: timestamp(now),
        };
        Ok(PreparedWrite::put_if_absent(keyed_item(
            &Self::key(chat_id, user_id),
            &member,
        )?))
    }

    /// Delete the membership; fails the transaction if it does not exist.
    pub fn transact_delete(chat_id: &str, user_id: &str) -> PreparedWrite {
        PreparedWrite::delete_if(Self::key(chat_id, user_id), Condition::Exists)
    }

    pub async fn get(&self, chat_id: &str, user_id: &str) -> Result<Option<ChatMember>> {
        self.store
            .get(&Self::key(chat_id, user_id), false)
            .await?
            .map(from_item)
            .transpose()
    }

    /// Member user ids of a chat.
    pub async fn user_ids_by_chat(&self, chat_id: &str) -> Result<Vec<String>> {
        let query = Query::partition(format!("chat/{}", chat_id))
            .sort_begins_with(MEMBER_PREFIX)
            .project(&[SORT_KEY]);
        let items: Vec<Item> = self.store.query_stream(query).try_collect().await?;
        items
            .iter()
            .map(|item| id_from(item, SORT_KEY))
            .collect()
    }

    /// Chat ids a user is a member of, most recently active first.
    pub async fn chat_ids_by_user(&self, user_id: &str) -> Result<Vec<String>> {
        let query = Query::partition(format!("{}{}", MEMBER_PREFIX, user_id))
            .on_index(GSI_K1)
            .project(&[PARTITION_KEY])
            .descending();
        let items: Vec<Item> = self.store.query_stream(query).try_collect().await?;
        items
            .iter()
            .map(|item| id_from(item, PARTITION_KEY))
            .collect()
    }

    pub async fn increment_messages_unviewed_count(
        &self,
        chat_id: &str,
        user_id: &str,
        mode: CounterMode,
    ) -> counter::Result<CounterOutcome> {
        self.counters
            .increment(&Self::key(chat_id, user_id), MESSAGES_UNVIEWED_COUNT, 1, mode)
            .await
    }

    pub async fn decrement_messages_unviewed_count(
        &self,
        chat_id: &str,
        user_id: &str,
        mode: CounterMode,
    ) -> counter::Result<CounterOutcome> {
        self.counters
            .decrement(&Self::key(chat_id, user_id), MESSAGES_UNVIEWED_COUNT, 1, mode)
            .await
    }

    pub async fn clear_messages_unviewed_count(
        &self,
        chat_id: &str,
        user_id: &str,
        mode: CounterMode,
    ) -> counter::Result<CounterOutcome> {
        self.counters
            .clear(&Self::key(chat_id, user_id), MESSAGES_UNVIEWED_COUNT, mode)
            .await
    }

    /// Move the member's activity timestamp (and index sort key) forward.
    pub async fn update_last_message_activity_at(
        &self,
        chat_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
        mode: CounterMode,
    ) -> counter::Result<CounterOutcome> {
        let at = timestamp(at);
        self.counters
            .apply(
                &Self::key(chat_id, user_id),
                vec![
                    UpdateAction::set(LAST_MESSAGE_ACTIVITY_AT, at.clone()),
                    UpdateAction::set(GSI_K1_SORT_KEY, at.clone()),
                ],
                Some(Condition::missing_or_before(LAST_MESSAGE_ACTIVITY_AT, at)),
                mode,
            )
            .await
    }
}

fn id_from(item: &Item, attr: &str) -> Result<String> {
    item.get(attr)
        .and_then(|v| v.as_str())
        .and_then(key_id)
        .map(str::to_string)
        .ok_or_else(|| StoreError::Validation(format!("`{}` is not a `prefix/<id>` key", attr)))
}
