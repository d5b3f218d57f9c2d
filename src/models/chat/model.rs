//! A chat bound to its manager.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::repository::{ChatMemberRepository, ChatRepository, ChatRow};
use super::{ChatError, ChatManager, ChatType, Result};
use crate::models::chat_message::ChatMessage;
use crate::models::user::{User, UserRepository};
use crate::models::view::{ViewRepository, Viewable};
use crate::storage::StoreError;
use crate::transact::{TransactError, TransactPlan};

/// What `leave` did to the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Other members remain.
    Left,
    /// The last member left and the chat was deleted.
    Deleted,
}

pub struct Chat {
    pub row: ChatRow,
    manager: Arc<ChatManager>,
}

impl fmt::Debug for Chat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chat").field("row", &self.row).finish()
    }
}

impl Chat {
    pub(crate) fn new(row: ChatRow, manager: Arc<ChatManager>) -> Self {
        Self { row, manager }
    }

    pub fn id(&self) -> &str {
        &self.row.chat_id
    }

    pub fn chat_type(&self) -> ChatType {
        self.row.chat_type
    }

    fn require(&self, expected: ChatType, operation: &'static str) -> Result<()> {
        if self.row.chat_type != expected {
            return Err(ChatError::WrongChatType {
                chat_id: self.row.chat_id.clone(),
                operation,
                expected,
            });
        }
        Ok(())
    }

    /// Reload the row. Returns false if the chat no longer exists.
    pub async fn refresh(&mut self, consistent: bool) -> Result<bool> {
        match self.manager.chats().get(&self.row.chat_id, consistent).await? {
            Some(row) => {
                self.row = row;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn is_member(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .manager
            .members()
            .get(&self.row.chat_id, user_id)
            .await?
            .is_some())
    }

    /// Rename a group chat. `None` leaves it unchanged; an empty name
    /// removes it.
    pub async fn edit(
        &mut self,
        edited_by: &User,
        name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.require(ChatType::Group, "edit")?;
        let Some(name) = name else {
            return Ok(());
        };
        self.row = self.manager.chats().update_name(&self.row.chat_id, name).await?;
        self.manager
            .messages()
            .add_system_message_group_name_edited(&self.row.chat_id, edited_by, name, now)
            .await?;
        Ok(())
    }

    /// Add users to a group chat. Users that do not exist, the adder
    /// themselves, users with a block in either direction and existing
    /// members are skipped. Returns the users actually added.
    pub async fn add(
        &mut self,
        added_by: &User,
        user_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<User>> {
        self.require(ChatType::Group, "add users to")?;
        let chat_id = self.row.chat_id.clone();

        let mut seen = HashSet::new();
        let mut added = Vec::new();
        for user_id in user_ids.iter().filter(|id| seen.insert(id.as_str())) {
            if *user_id == added_by.user_id {
                continue;
            }
            let Some(user) = self.manager.users().get_user(user_id).await? else {
                debug!(chat_id = %chat_id, user_id = %user_id, "Skipping unknown user");
                continue;
            };
            let blocks = self.manager.blocks();
            if blocks.is_blocked(&added_by.user_id, user_id).await?
                || blocks.is_blocked(user_id, &added_by.user_id).await?
            {
                debug!(chat_id = %chat_id, user_id = %user_id, "Skipping blocked user");
                continue;
            }

            let plan = TransactPlan::new()
                .with(
                    ChatMemberRepository::transact_add(&chat_id, user_id, now)?,
                    Some(ChatError::AlreadyMember {
                        chat_id: chat_id.clone(),
                        user_id: user_id.clone(),
                    }),
                )
                .with(
                    ChatRepository::transact_increment_user_count(&chat_id),
                    Some(ChatError::ChatNotFound(chat_id.clone())),
                )
                .with(
                    UserRepository::transact_increment_chat_count(user_id),
                    Some(ChatError::UserNotFound(user_id.clone())),
                );
            match self.manager.coordinator().commit(plan).await {
                Ok(()) => {
                    self.row.user_count += 1;
                    added.push(user);
                }
                Err(TransactError::Rejected(ChatError::AlreadyMember { .. })) => {
                    debug!(chat_id = %chat_id, user_id = %user_id, "User already a member");
                }
                Err(e) => return Err(e.into_domain()),
            }
        }

        if !added.is_empty() {
            self.manager
                .messages()
                .add_system_message_added_to_group(&chat_id, added_by, &added, now)
                .await?;
            info!(chat_id = %chat_id, added = added.len(), "Users added to group chat");
        }
        Ok(added)
    }

    /// Leave a group chat, deleting it if nobody is left.
    pub async fn leave(&mut self, user: &User, now: DateTime<Utc>) -> Result<LeaveOutcome> {
        self.require(ChatType::Group, "leave")?;
        let chat_id = self.row.chat_id.clone();

        let plan = TransactPlan::new()
            .with(
                ChatMemberRepository::transact_delete(&chat_id, &user.user_id),
                Some(ChatError::NotMember {
                    chat_id: chat_id.clone(),
                    user_id: user.user_id.clone(),
                }),
            )
            .with(ChatRepository::transact_decrement_user_count(&chat_id), None)
            .with(
                UserRepository::transact_decrement_chat_count(&user.user_id),
                None,
            );
        self.manager
            .coordinator()
            .commit(plan)
            .await
            .map_err(TransactError::into_domain)?;

        let exists = self.refresh(true).await?;
        if !exists || self.row.user_count <= 0 {
            if exists {
                self.delete_emptied_group_chat().await?;
            }
            info!(chat_id = %chat_id, user_id = %user.user_id, "Last member left, chat deleted");
            return Ok(LeaveOutcome::Deleted);
        }

        self.manager
            .messages()
            .add_system_message_left_group(&chat_id, user, now)
            .await?;
        Ok(LeaveOutcome::Left)
    }

    /// Delete a group chat whose last member just left. When members leave
    /// concurrently another leaver may already have deleted it.
    pub(crate) async fn delete_emptied_group_chat(&mut self) -> Result<()> {
        match self.delete_group_chat().await {
            Ok(_) => Ok(()),
            Err(ChatError::UnexpectedUserCount { chat_id, expected }) => {
                if self.refresh(true).await? {
                    return Err(ChatError::UnexpectedUserCount { chat_id, expected });
                }
                debug!(chat_id = %chat_id, "Emptied chat already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete an empty group chat, then its messages.
    pub async fn delete_group_chat(&self) -> Result<usize> {
        self.require(ChatType::Group, "delete group")?;
        let chat_id = &self.row.chat_id;

        let plan = TransactPlan::new().with(
            ChatRepository::transact_delete(chat_id, 0),
            Some(ChatError::UnexpectedUserCount {
                chat_id: chat_id.clone(),
                expected: 0,
            }),
        );
        self.manager
            .coordinator()
            .commit(plan)
            .await
            .map_err(TransactError::into_domain)?;

        Ok(self.manager.messages().truncate_chat_messages(chat_id).await?)
    }

    /// Delete a direct chat and both memberships atomically, then its
    /// messages. The chat row goes first so it is never observed without
    /// its messages.
    pub async fn delete_direct_chat(&self) -> Result<usize> {
        self.require(ChatType::Direct, "delete direct")?;
        let chat_id = &self.row.chat_id;
        let (user_id_1, user_id_2) = self.row.direct_user_ids().ok_or_else(|| {
            ChatError::Store(StoreError::Validation(format!(
                "direct chat `{}` has no user pair",
                chat_id
            )))
        })?;

        let plan = TransactPlan::new()
            .with(
                ChatRepository::transact_delete(chat_id, 2),
                Some(ChatError::UnexpectedUserCount {
                    chat_id: chat_id.clone(),
                    expected: 2,
                }),
            )
            .with(ChatMemberRepository::transact_delete(chat_id, user_id_1), None)
            .with(ChatMemberRepository::transact_delete(chat_id, user_id_2), None)
            .with(UserRepository::transact_decrement_chat_count(user_id_1), None)
            .with(UserRepository::transact_decrement_chat_count(user_id_2), None);
        self.manager
            .coordinator()
            .commit(plan)
            .await
            .map_err(TransactError::into_domain)?;

        info!(chat_id = %chat_id, "Direct chat deleted");
        Ok(self.manager.messages().truncate_chat_messages(chat_id).await?)
    }

    /// Post a message as a member.
    pub async fn add_message(
        &self,
        message_id: &str,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage> {
        self.manager
            .messages()
            .add_chat_message(message_id, text, &self.row.chat_id, user_id, now)
            .await
    }
}

#[async_trait]
impl Viewable for Chat {
    fn view_partition(&self) -> String {
        ChatRepository::key(&self.row.chat_id).partition
    }

    /// Chats have no owner.
    fn owner_user_id(&self) -> Option<&str> {
        None
    }

    fn views(&self) -> &ViewRepository {
        self.manager.views()
    }
}
