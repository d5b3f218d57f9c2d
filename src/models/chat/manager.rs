//! Chat lifecycle and chat counter reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::model::{Chat, LeaveOutcome};
use super::repository::{
    ChatMemberRepository, ChatRepository, ChatRow, MESSAGES_UNVIEWED_COUNT,
};
use super::{ChatError, ChatType, Result};
use crate::counter::{CounterMode, CounterOutcome};
use crate::models::block::BlockManager;
use crate::models::card::{CardRepository, CardSpec};
use crate::models::chat_message::{ChatMessageManager, ChatMessageRepository};
use crate::models::user::{User, UserRepository};
use crate::models::view::{ViewRepository, Viewable};
use crate::storage::helpers::{count_of, key_id};
use crate::storage::Item;
use crate::transact::{TransactError, TransactPlan, TransactionCoordinator};

/// Result of [`ChatManager::leave_all_chats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveAllSummary {
    /// Direct chats deleted.
    pub deleted_direct: usize,
    /// Group chats left (including ones deleted as a result).
    pub left_group: usize,
    /// Chats that could not be resolved or failed; logged and skipped.
    pub skipped: usize,
}

pub struct ChatManager {
    chats: ChatRepository,
    members: ChatMemberRepository,
    users: UserRepository,
    blocks: Arc<BlockManager>,
    messages: Arc<ChatMessageManager>,
    cards: CardRepository,
    views: ViewRepository,
    coordinator: TransactionCoordinator,
}

impl ChatManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chats: ChatRepository,
        members: ChatMemberRepository,
        users: UserRepository,
        blocks: Arc<BlockManager>,
        messages: Arc<ChatMessageManager>,
        cards: CardRepository,
        views: ViewRepository,
        coordinator: TransactionCoordinator,
    ) -> Self {
        Self {
            chats,
            members,
            users,
            blocks,
            messages,
            cards,
            views,
            coordinator,
        }
    }

    pub fn chats(&self) -> &ChatRepository {
        &self.chats
    }

    pub fn members(&self) -> &ChatMemberRepository {
        &self.members
    }

    pub fn users(&self) -> &UserRepository {
        &self.users
    }

    pub fn blocks(&self) -> &BlockManager {
        &self.blocks
    }

    pub fn messages(&self) -> &ChatMessageManager {
        &self.messages
    }

    pub fn views(&self) -> &ViewRepository {
        &self.views
    }

    pub(crate) fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    fn init_chat(self: &Arc<Self>, row: ChatRow) -> Chat {
        Chat::new(row, self.clone())
    }

    pub async fn get_chat(self: &Arc<Self>, chat_id: &str) -> Result<Option<Chat>> {
        self.get_chat_with(chat_id, false).await
    }

    pub async fn get_chat_with(
        self: &Arc<Self>,
        chat_id: &str,
        consistent: bool,
    ) -> Result<Option<Chat>> {
        Ok(self
            .chats
            .get(chat_id, consistent)
            .await?
            .map(|row| self.init_chat(row)))
    }

    pub async fn get_direct_chat(
        self: &Arc<Self>,
        user_id_1: &str,
        user_id_2: &str,
    ) -> Result<Option<Chat>> {
        Ok(self
            .chats
            .get_direct_chat(user_id_1, user_id_2)
            .await?
            .map(|row| self.init_chat(row)))
    }

    /// Open a direct chat between two users.
    ///
    /// The existing-chat lookup is advisory; the put-if-absent on the chat
    /// row inside the transaction is what rejects a duplicate id.
    pub async fn add_direct_chat(
        self: &Arc<Self>,
        chat_id: &str,
        created_by_user_id: &str,
        with_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Chat> {
        if created_by_user_id == with_user_id {
            return Err(ChatError::SelfChat(created_by_user_id.to_string()));
        }
        for (blocker, blocked) in [
            (created_by_user_id, with_user_id),
            (with_user_id, created_by_user_id),
        ] {
            if self.blocks.is_blocked(blocker, blocked).await? {
                return Err(ChatError::Blocked {
                    blocker_user_id: blocker.to_string(),
                    blocked_user_id: blocked.to_string(),
                });
            }
        }
        if self
            .chats
            .get_direct_chat(created_by_user_id, with_user_id)
            .await?
            .is_some()
        {
            return Err(ChatError::DirectChatExists {
                user_id: created_by_user_id.to_string(),
                with_user_id: with_user_id.to_string(),
            });
        }

        let row = ChatRepository::new_row(
            chat_id,
            ChatType::Direct,
            created_by_user_id,
            Some(with_user_id),
            None,
            now,
        );
        let already_member = |user_id: &str| ChatError::AlreadyMember {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
        };
        let plan = TransactPlan::new()
            .with(
                ChatRepository::transact_add(&row)?,
                Some(ChatError::ChatIdUsed(chat_id.to_string())),
            )
            .with(
                ChatMemberRepository::transact_add(chat_id, created_by_user_id, now)?,
                Some(already_member(created_by_user_id)),
            )
            .with(
                ChatMemberRepository::transact_add(chat_id, with_user_id, now)?,
                Some(already_member(with_user_id)),
            )
            .with(
                UserRepository::transact_increment_chat_count(created_by_user_id),
                Some(ChatError::UserNotFound(created_by_user_id.to_string())),
            )
            .with(
                UserRepository::transact_increment_chat_count(with_user_id),
                Some(ChatError::UserNotFound(with_user_id.to_string())),
            );
        self.coordinator
            .commit(plan)
            .await
            .map_err(TransactError::into_domain)?;

        info!(chat_id, created_by_user_id, with_user_id, "Direct chat created");
        self.get_chat_with(chat_id, true)
            .await?
            .ok_or_else(|| ChatError::ChatNotFound(chat_id.to_string()))
    }

    /// Create a group chat containing only its creator.
    pub async fn add_group_chat(
        self: &Arc<Self>,
        chat_id: &str,
        created_by: &User,
        name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Chat> {
        let row = ChatRepository::new_row(
            chat_id,
            ChatType::Group,
            &created_by.user_id,
            None,
            name,
            now,
        );
        let plan = TransactPlan::new()
            .with(
                ChatRepository::transact_add(&row)?,
                Some(ChatError::ChatIdUsed(chat_id.to_string())),
            )
            .with(
                ChatMemberRepository::transact_add(chat_id, &created_by.user_id, now)?,
                Some(ChatError::AlreadyMember {
                    chat_id: chat_id.to_string(),
                    user_id: created_by.user_id.clone(),
                }),
            )
            .with(
                UserRepository::transact_increment_chat_count(&created_by.user_id),
                Some(ChatError::UserNotFound(created_by.user_id.clone())),
            );
        self.coordinator
            .commit(plan)
            .await
            .map_err(TransactError::into_domain)?;

        self.messages
            .add_system_message_group_created(chat_id, created_by, name, now)
            .await?;

        info!(chat_id, created_by_user_id = %created_by.user_id, "Group chat created");
        self.get_chat_with(chat_id, true)
            .await?
            .ok_or_else(|| ChatError::ChatNotFound(chat_id.to_string()))
    }

    /// Delete the user's direct chats and leave their group chats.
    ///
    /// Memberships are read first; each chat is then handled in its own
    /// transaction. Chats that fail are logged and skipped.
    pub async fn leave_all_chats(
        self: &Arc<Self>,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LeaveAllSummary> {
        let chat_ids = self.members.chat_ids_by_user(user_id).await?;
        let mut summary = LeaveAllSummary::default();
        let mut user: Option<User> = None;

        for chat_id in chat_ids {
            let mut chat = match self.get_chat(&chat_id).await {
                Ok(Some(chat)) => chat,
                Ok(None) => {
                    warn!(chat_id = %chat_id, user_id, "Unable to find chat user is member of, ignoring");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(
                        chat_id = %chat_id,
                        user_id,
                        error = %e,
                        "Failed to load chat, skipping"
                    );
                    summary.skipped += 1;
                    continue;
                }
            };

            let result = match chat.chat_type() {
                ChatType::Direct => chat.delete_direct_chat().await.map(|_| {
                    summary.deleted_direct += 1;
                }),
                ChatType::Group => {
                    if user.is_none() {
                        match self.users.get_user(user_id).await {
                            Ok(found) => user = found,
                            Err(e) => {
                                warn!(
                                    chat_id = %chat_id,
                                    user_id,
                                    error = %e,
                                    "Failed to load user, skipping"
                                );
                                summary.skipped += 1;
                                continue;
                            }
                        }
                    }
                    match &user {
                        Some(user) => chat.leave(user, now).await.map(|_: LeaveOutcome| {
                            summary.left_group += 1;
                        }),
                        None => Err(ChatError::UserNotFound(user_id.to_string())),
                    }
                }
            };
            if let Err(e) = result {
                warn!(chat_id = %chat_id, user_id, error = %e, "Failed to leave chat, skipping");
                summary.skipped += 1;
            }
        }

        info!(
            user_id,
            deleted_direct = summary.deleted_direct,
            left_group = summary.left_group,
            skipped = summary.skipped,
            "Left all chats"
        );
        Ok(summary)
    }

    /// Record chat views by a user. Repeated ids count as multiple views.
    /// Missing chats and chats the user is not a member of are skipped.
    pub async fn record_views(
        self: &Arc<Self>,
        chat_ids: &[String],
        user_id: &str,
        viewed_at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut counts: Vec<(&str, i64)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for chat_id in chat_ids.iter().map(String::as_str) {
            match index.get(chat_id) {
                Some(&i) => counts[i].1 += 1,
                None => {
                    index.insert(chat_id, counts.len());
                    counts.push((chat_id, 1));
                }
            }
        }

        let mut recorded = 0;
        for (chat_id, view_count) in counts {
            let Some(chat) = self.get_chat(chat_id).await? else {
                warn!(chat_id, user_id, "Cannot record view(s) on missing chat");
                continue;
            };
            if !chat.is_member(user_id).await? {
                warn!(chat_id, user_id, "Cannot record view(s) by non-member");
                continue;
            }
            chat.record_view(user_id, view_count, viewed_at).await?;
            recorded += 1;
        }
        Ok(recorded)
    }

    /// React to a change of a `chat/<id>` row.
    ///
    /// - `member/<userId>`: a 0 -> nonzero transition of
    ///   `messagesUnviewedCount` increments the user's
    ///   chats-with-unviewed-messages count, nonzero -> 0 decrements it.
    /// - `view/<userId>` added or edited: clears the member's unviewed count
    ///   and removes their chat activity card.
    pub async fn postprocess_record(
        &self,
        partition_key: &str,
        sort_key: &str,
        old: Option<&Item>,
        new: Option<&Item>,
    ) -> Result<()> {
        let Some(chat_id) = key_id(partition_key) else {
            return Ok(());
        };

        if let Some(user_id) = sort_key.strip_prefix("member/") {
            let old_count = count_of(old, MESSAGES_UNVIEWED_COUNT);
            let new_count = count_of(new, MESSAGES_UNVIEWED_COUNT);
            if old_count == 0 && new_count != 0 {
                let outcome = self
                    .users
                    .increment_chats_with_unviewed_messages_count(user_id, CounterMode::Strict)
                    .await?;
                log_soft(outcome, "chatsWithUnviewedMessagesCount", user_id);
            }
            if old_count != 0 && new_count == 0 {
                let outcome = self
                    .users
                    .decrement_chats_with_unviewed_messages_count(user_id, CounterMode::FailSoft)
                    .await?;
                log_soft(outcome, "chatsWithUnviewedMessagesCount", user_id);
            }
        }

        if let Some(user_id) = sort_key.strip_prefix("view/") {
            if new.is_some() {
                let outcome = self
                    .members
                    .clear_messages_unviewed_count(chat_id, user_id, CounterMode::FailSoft)
                    .await?;
                log_soft(outcome, MESSAGES_UNVIEWED_COUNT, user_id);
                self.cards
                    .remove_card_if_exists(&CardSpec::chat_activity(user_id))
                    .await?;
            }
        }
        Ok(())
    }

    /// A message was added: bump chat counters and activity, and mark it
    /// unviewed for every member but the author.
    pub async fn postprocess_chat_message_added(
        &self,
        chat_id: &str,
        author_user_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let outcome = self
            .chats
            .update_last_message_activity_at(chat_id, created_at, CounterMode::FailSoft)
            .await?;
        log_soft(outcome, "lastMessageActivityAt", chat_id);
        let outcome = self
            .chats
            .increment_messages_count(chat_id, CounterMode::FailSoft)
            .await?;
        log_soft(outcome, "messagesCount", chat_id);

        for user_id in self.members.user_ids_by_chat(chat_id).await? {
            let outcome = self
                .members
                .update_last_message_activity_at(chat_id, &user_id, created_at, CounterMode::FailSoft)
                .await?;
            log_soft(outcome, "lastMessageActivityAt", &user_id);
            if Some(user_id.as_str()) == author_user_id {
                continue;
            }
            let outcome = self
                .members
                .increment_messages_unviewed_count(chat_id, &user_id, CounterMode::FailSoft)
                .await?;
            log_soft(outcome, MESSAGES_UNVIEWED_COUNT, &user_id);
            self.cards
                .add_card_if_absent(&CardSpec::chat_activity(&user_id), created_at)
                .await?;
        }
        Ok(())
    }

    /// A message was deleted: decrement the chat's message count and, for
    /// every member but the author, drop their view of the message and
    /// decrement their unviewed count if they had not seen it.
    pub async fn postprocess_chat_message_deleted(
        &self,
        chat_id: &str,
        message_id: &str,
        author_user_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let outcome = self
            .chats
            .decrement_messages_count(chat_id, CounterMode::FailSoft)
            .await?;
        log_soft(outcome, "messagesCount", chat_id);

        let message_partition = ChatMessageRepository::key(message_id).partition;
        let chat_partition = ChatRepository::key(chat_id).partition;
        for user_id in self.members.user_ids_by_chat(chat_id).await? {
            if Some(user_id.as_str()) == author_user_id {
                continue;
            }
            let message_view_deleted = self
                .messages
                .views()
                .delete_view(&message_partition, &user_id)
                .await?;
            let chat_viewed_after = self
                .views
                .get_view(&chat_partition, &user_id)
                .await?
                .is_some_and(|view| view.last_viewed_at > created_at);
            if message_view_deleted || chat_viewed_after {
                continue;
            }
            let outcome = self
                .members
                .decrement_messages_unviewed_count(chat_id, &user_id, CounterMode::FailSoft)
                .await?;
            log_soft(outcome, MESSAGES_UNVIEWED_COUNT, &user_id);
        }

        // views by users who have since left the chat
        self.messages.views().delete_views(&message_partition).await?;
        Ok(())
    }

    /// A member viewed a single message.
    pub async fn postprocess_chat_message_view_added(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let outcome = self
            .members
            .decrement_messages_unviewed_count(chat_id, user_id, CounterMode::FailSoft)
            .await?;
        log_soft(outcome, MESSAGES_UNVIEWED_COUNT, user_id);
        Ok(())
    }
}

fn log_soft(outcome: CounterOutcome, field: &str, id: &str) {
    if !outcome.is_applied() {
        debug!(field, id, ?outcome, "Counter reconciliation skipped");
    }
}
