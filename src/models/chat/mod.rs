//! Chats and chat memberships.
//!
//! Each lifecycle step (create, add members, leave, delete) is one atomic
//! transaction of bounded size, followed by non-atomic side effects: system
//! messages and message truncation. Counters that cannot join those
//! transactions are reconciled by the postprocessor handlers on
//! [`ChatManager`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::counter::CounterError;
use crate::models::block::BlockError;
use crate::storage::StoreError;
use crate::transact::TransactFailure;

mod manager;
mod model;
mod repository;

pub use manager::{ChatManager, LeaveAllSummary};
pub use model::{Chat, LeaveOutcome};
pub use repository::{ChatMember, ChatMemberRepository, ChatRepository, ChatRow};

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatType {
    Direct,
    Group,
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatType::Direct => write!(f, "DIRECT"),
            ChatType::Group => write!(f, "GROUP"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("User `{0}` cannot open direct chat with themselves")]
    SelfChat(String),

    #[error("User `{blocker_user_id}` has blocked user `{blocked_user_id}`")]
    Blocked {
        blocker_user_id: String,
        blocked_user_id: String,
    },

    #[error("Chat already exists between user `{user_id}` and user `{with_user_id}`")]
    DirectChatExists {
        user_id: String,
        with_user_id: String,
    },

    #[error("Unable to add chat with id `{0}`... id already used?")]
    ChatIdUsed(String),

    #[error("Chat `{0}` does not exist")]
    ChatNotFound(String),

    #[error("Cannot {operation} non-{expected} chat `{chat_id}`")]
    WrongChatType {
        chat_id: String,
        operation: &'static str,
        expected: ChatType,
    },

    #[error("Chat `{chat_id}` does not have {expected} members")]
    UnexpectedUserCount { chat_id: String, expected: i64 },

    #[error("Unable to add user `{user_id}` to chat `{chat_id}`")]
    AlreadyMember { chat_id: String, user_id: String },

    #[error("User `{user_id}` is not a member of chat `{chat_id}`")]
    NotMember { chat_id: String, user_id: String },

    #[error("User `{0}` does not exist")]
    UserNotFound(String),

    #[error("Unable to add message with id `{0}`... id already used?")]
    MessageIdUsed(String),

    #[error("Chat message `{0}` does not exist")]
    MessageNotFound(String),

    #[error("User `{user_id}` is not authorized to change message `{message_id}`")]
    NotAuthorized { user_id: String, message_id: String },

    #[error(transparent)]
    Transaction(#[from] TransactFailure),

    #[error(transparent)]
    Counter(#[from] CounterError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests;
