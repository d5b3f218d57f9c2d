//! Chat messages and system messages.
//!
//! Message counters and unviewed counts are not touched here: they are
//! reconciled by the postprocessor from the message rows' change records.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::chat::{ChatError, ChatMemberRepository};
use crate::models::user::User;
use crate::models::view::ViewRepository;
use crate::storage::helpers::{from_item, keyed_item, timestamp, ts};
use crate::storage::schema::{GSI_A1, GSI_A1_SORT_KEY, PARTITION_KEY, SORT_KEY};
use crate::storage::{Condition, Key, Query, Result, Store, StoreError, UpdateAction};

/// `chatMessage/<id>` | `-`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: String,
    pub chat_id: String,
    /// Author; `None` for system messages.
    #[serde(default)]
    pub user_id: Option<String>,
    pub text: String,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "ts::option")]
    pub last_edited_at: Option<DateTime<Utc>>,
    /// `chatMessage/<chatId>`
    pub gsi_a1_partition_key: String,
    pub gsi_a1_sort_key: String,
}

impl ChatMessage {
    pub fn partition(&self) -> String {
        ChatMessageRepository::key(&self.message_id).partition
    }
}

#[derive(Clone)]
pub struct ChatMessageRepository {
    store: Arc<dyn Store>,
}

impl ChatMessageRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn key(message_id: &str) -> Key {
        Key::new(format!("chatMessage/{}", message_id), "-")
    }

    pub async fn add_message(
        &self,
        message_id: &str,
        chat_id: &str,
        user_id: Option<&str>,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage> {
        let message = ChatMessage {
            message_id: message_id.to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.map(str::to_string),
            text: text.to_string(),
            created_at: now,
            last_edited_at: None,
            gsi_a1_partition_key: format!("chatMessage/{}", chat_id),
            gsi_a1_sort_key: timestamp(now),
        };
        let item = keyed_item(&Self::key(message_id), &message)?;
        self.store.put(item, Some(Condition::NotExists)).await?;
        Ok(message)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<ChatMessage>> {
        self.store
            .get(&Self::key(message_id), false)
            .await?
            .map(from_item)
            .transpose()
    }

    pub async fn edit_message(
        &self,
        message_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage> {
        let item = self
            .store
            .update(
                &Self::key(message_id),
                vec![
                    UpdateAction::set("text", text),
                    UpdateAction::set("lastEditedAt", timestamp(now)),
                ],
                Some(Condition::Exists),
            )
            .await?;
        from_item(item)
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<Option<ChatMessage>> {
        self.store
            .delete(&Self::key(message_id), None)
            .await?
            .map(from_item)
            .transpose()
    }

    /// Keys of every message in a chat, oldest first.
    pub fn message_keys_by_chat(&self, chat_id: &str) -> BoxStream<'_, Result<Key>> {
        let query = Query::partition(format!("chatMessage/{}", chat_id))
            .on_index(GSI_A1)
            .project(&[PARTITION_KEY, SORT_KEY, GSI_A1_SORT_KEY]);
        let schema = self.store.schema().clone();
        self.store
            .query_stream(query)
            .and_then(move |item| {
                futures::future::ready(schema.key_of(&item).ok_or_else(|| {
                    StoreError::Validation(format!("message row without key: {:?}", item))
                }))
            })
            .boxed()
    }

    /// Every message in a chat, oldest first.
    pub fn messages_by_chat(&self, chat_id: &str) -> BoxStream<'_, Result<ChatMessage>> {
        let query = Query::partition(format!("chatMessage/{}", chat_id)).on_index(GSI_A1);
        self.store
            .query_stream(query)
            .and_then(|item| futures::future::ready(from_item(item)))
            .boxed()
    }
}

pub struct ChatMessageManager {
    messages: ChatMessageRepository,
    members: ChatMemberRepository,
    views: ViewRepository,
    store: Arc<dyn Store>,
    batch_size: usize,
}

impl ChatMessageManager {
    pub fn new(
        messages: ChatMessageRepository,
        members: ChatMemberRepository,
        views: ViewRepository,
        store: Arc<dyn Store>,
        batch_size: usize,
    ) -> Self {
        Self {
            messages,
            members,
            views,
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn messages(&self) -> &ChatMessageRepository {
        &self.messages
    }

    pub fn views(&self) -> &ViewRepository {
        &self.views
    }

    /// Add a message by a chat member.
    pub async fn add_chat_message(
        &self,
        message_id: &str,
        text: &str,
        chat_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<ChatMessage, ChatError> {
        if self.members.get(chat_id, user_id).await?.is_none() {
            return Err(ChatError::NotMember {
                chat_id: chat_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        match self
            .messages
            .add_message(message_id, chat_id, Some(user_id), text, now)
            .await
        {
            Ok(message) => Ok(message),
            Err(StoreError::ConditionFailed { .. }) => {
                Err(ChatError::MessageIdUsed(message_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Edit a message. Only its author may.
    pub async fn edit_chat_message(
        &self,
        message_id: &str,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<ChatMessage, ChatError> {
        self.authored(message_id, user_id).await?;
        Ok(self.messages.edit_message(message_id, text, now).await?)
    }

    /// Delete a message. Only its author may. The message's own view rows
    /// are reconciled and removed by the postprocessor.
    pub async fn delete_chat_message(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> std::result::Result<ChatMessage, ChatError> {
        let message = self.authored(message_id, user_id).await?;
        self.messages.delete_message(message_id).await?;
        Ok(message)
    }

    async fn authored(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> std::result::Result<ChatMessage, ChatError> {
        let message = self
            .messages
            .get_message(message_id)
            .await?
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        if message.user_id.as_deref() != Some(user_id) {
            return Err(ChatError::NotAuthorized {
                user_id: user_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        Ok(message)
    }

    pub async fn add_system_message(
        &self,
        chat_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage> {
        let message_id = Uuid::new_v4().to_string();
        self.messages
            .add_message(&message_id, chat_id, None, text, now)
            .await
    }

    pub async fn add_system_message_group_created(
        &self,
        chat_id: &str,
        created_by: &User,
        name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage> {
        let mut text = format!("{} created the group", created_by.mention());
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            text.push_str(&format!(" \"{}\"", name));
        }
        self.add_system_message(chat_id, &text, now).await
    }

    pub async fn add_system_message_added_to_group(
        &self,
        chat_id: &str,
        added_by: &User,
        users: &[User],
        now: DateTime<Utc>,
    ) -> Result<ChatMessage> {
        let mentions: Vec<String> = users.iter().map(User::mention).collect();
        let joined = match mentions.split_last() {
            Some((last, rest)) if !rest.is_empty() => format!("{} and {}", rest.join(", "), last),
            Some((last, _)) => last.clone(),
            None => String::new(),
        };
        let text = format!("{} added {} to the group", added_by.mention(), joined);
        self.add_system_message(chat_id, &text, now).await
    }

    pub async fn add_system_message_left_group(
        &self,
        chat_id: &str,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage> {
        let text = format!("{} left the group", user.mention());
        self.add_system_message(chat_id, &text, now).await
    }

    pub async fn add_system_message_group_name_edited(
        &self,
        chat_id: &str,
        edited_by: &User,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage> {
        let text = if name.is_empty() {
            format!("{} deleted the name of the group", edited_by.mention())
        } else {
            format!(
                "{} changed the name of the group to \"{}\"",
                edited_by.mention(),
                name
            )
        };
        self.add_system_message(chat_id, &text, now).await
    }

    /// Record views of messages by a chat member. Duplicates count as
    /// separate views; unknown messages and non-members are skipped.
    pub async fn record_views(
        &self,
        message_ids: &[String],
        user_id: &str,
        viewed_at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut recorded = 0;
        let mut seen = HashSet::new();
        for message_id in message_ids {
            if !seen.insert(message_id) {
                continue;
            }
            let view_count = message_ids.iter().filter(|id| *id == message_id).count() as i64;
            let Some(message) = self.messages.get_message(message_id).await? else {
                warn!(message_id = %message_id, user_id, "Cannot record view on missing message");
                continue;
            };
            if self.members.get(&message.chat_id, user_id).await?.is_none() {
                warn!(
                    message_id = %message_id,
                    chat_id = %message.chat_id,
                    user_id,
                    "Cannot record view by non-member"
                );
                continue;
            }
            if message.user_id.as_deref() == Some(user_id) {
                continue;
            }
            self.views
                .record_chat_message_view(
                    &message.partition(),
                    &message.chat_id,
                    user_id,
                    view_count,
                    viewed_at,
                )
                .await?;
            recorded += 1;
        }
        Ok(recorded)
    }

    /// Delete every message of a chat along with the messages' view rows.
    /// Returns the number of messages deleted.
    pub async fn truncate_chat_messages(&self, chat_id: &str) -> Result<usize> {
        let message_keys: Vec<Key> = self
            .messages
            .message_keys_by_chat(chat_id)
            .try_collect()
            .await?;

        for chunk in message_keys.chunks(self.batch_size) {
            let mut keys = chunk.to_vec();
            for key in chunk {
                keys.extend(self.views.view_keys(&key.partition).await?);
            }
            for batch in keys.chunks(self.batch_size) {
                self.store.batch_delete(batch.to_vec()).await?;
            }
        }

        debug!(chat_id, messages = message_keys.len(), "Truncated chat messages");
        Ok(message_keys.len())
    }
}
