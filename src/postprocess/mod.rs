//! Change-stream postprocessor.
//!
//! Consumes before/after snapshots of committed rows and reconciles the
//! counters that could not be updated in the originating transaction.
//! Records are routed to [`ChangeHandler`]s by key shape; every handler is
//! safe to run more than once on the same record.

mod pool;

pub use pool::{PoolStats, PostprocessorPool};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::models::chat::{ChatError, ChatManager};
use crate::models::chat_message::ChatMessage;
use crate::storage::change::{ChangeKind, ChangeRecord};
use crate::storage::helpers::{from_item, key_id};
use crate::storage::{Item, StoreError};

pub type Result<T> = std::result::Result<T, PostprocessError>;

#[derive(Debug, thiserror::Error)]
pub enum PostprocessError {
    #[error("Malformed change record for {partition_key}/{sort_key}: {reason}")]
    MalformedRecord {
        partition_key: String,
        sort_key: String,
        reason: String,
    },

    #[error("Postprocessor pool is shut down")]
    PoolClosed,

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A reconciliation target for change records.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this handler reacts to the record's key shape.
    fn handles(&self, record: &ChangeRecord) -> bool;

    async fn handle(&self, record: &ChangeRecord) -> Result<()>;
}

/// `chat/<chatId>` rows: memberships and chat views.
pub struct ChatRecordHandler {
    chats: Arc<ChatManager>,
}

impl ChatRecordHandler {
    pub fn new(chats: Arc<ChatManager>) -> Self {
        Self { chats }
    }
}

#[async_trait]
impl ChangeHandler for ChatRecordHandler {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn handles(&self, record: &ChangeRecord) -> bool {
        record.partition_key.starts_with("chat/")
            && (record.sort_key.starts_with("member/") || record.sort_key.starts_with("view/"))
    }

    async fn handle(&self, record: &ChangeRecord) -> Result<()> {
        self.chats
            .postprocess_record(
                &record.partition_key,
                &record.sort_key,
                record.old.as_ref(),
                record.new.as_ref(),
            )
            .await?;
        Ok(())
    }
}

/// `chatMessage/<messageId>` rows: messages added, deleted and viewed.
pub struct ChatMessageHandler {
    chats: Arc<ChatManager>,
}

impl ChatMessageHandler {
    pub fn new(chats: Arc<ChatManager>) -> Self {
        Self { chats }
    }

    fn message(record: &ChangeRecord, snapshot: Option<&Item>) -> Result<ChatMessage> {
        let item = snapshot.cloned().ok_or_else(|| malformed(record, "missing snapshot"))?;
        from_item(item).map_err(|e| malformed(record, &e.to_string()))
    }
}

#[async_trait]
impl ChangeHandler for ChatMessageHandler {
    fn name(&self) -> &'static str {
        "chat_message"
    }

    fn handles(&self, record: &ChangeRecord) -> bool {
        record.partition_key.starts_with("chatMessage/")
    }

    async fn handle(&self, record: &ChangeRecord) -> Result<()> {
        let kind = record.kind();

        if record.sort_key == "-" {
            match kind {
                Some(ChangeKind::Insert) => {
                    let message = Self::message(record, record.new.as_ref())?;
                    self.chats
                        .postprocess_chat_message_added(
                            &message.chat_id,
                            message.user_id.as_deref(),
                            message.created_at,
                        )
                        .await?;
                }
                Some(ChangeKind::Remove) => {
                    let message = Self::message(record, record.old.as_ref())?;
                    self.chats
                        .postprocess_chat_message_deleted(
                            &message.chat_id,
                            &message.message_id,
                            message.user_id.as_deref(),
                            message.created_at,
                        )
                        .await?;
                }
                _ => {}
            }
            return Ok(());
        }

        let user_id = record.sort_key.strip_prefix("view/");
        if let (Some(user_id), Some(ChangeKind::Insert)) = (user_id, kind) {
            let stamped = record
                .new
                .as_ref()
                .and_then(|item| item.get("chatId"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let chat_id = match stamped {
                Some(chat_id) => chat_id,
                None => {
                    let message_id = key_id(&record.partition_key)
                        .ok_or_else(|| malformed(record, "no message id in partition key"))?;
                    match self.chats.messages().messages().get_message(message_id).await? {
                        Some(message) => message.chat_id,
                        None => {
                            debug!(
                                message_id,
                                user_id,
                                "View without chat on deleted message, ignoring"
                            );
                            return Ok(());
                        }
                    }
                }
            };
            self.chats
                .postprocess_chat_message_view_added(&chat_id, user_id)
                .await?;
        }
        Ok(())
    }
}

fn malformed(record: &ChangeRecord, reason: &str) -> PostprocessError {
    PostprocessError::MalformedRecord {
        partition_key: record.partition_key.clone(),
        sort_key: record.sort_key.clone(),
        reason: reason.to_string(),
    }
}

/// Routes change records to the registered handlers.
pub struct Postprocessor {
    handlers: Vec<Box<dyn ChangeHandler>>,
}

impl Postprocessor {
    /// Postprocessor with the chat and chat message handlers registered.
    pub fn new(chats: Arc<ChatManager>) -> Self {
        Self::empty()
            .with_handler(Box::new(ChatRecordHandler::new(chats.clone())))
            .with_handler(Box::new(ChatMessageHandler::new(chats)))
    }

    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: Box<dyn ChangeHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Run every handler matching the record. Returns how many handled it;
    /// zero means the record's shape is not one we reconcile.
    pub async fn dispatch(&self, record: &ChangeRecord) -> Result<usize> {
        let mut handled = 0;
        for handler in self.handlers.iter().filter(|h| h.handles(record)) {
            if let Err(e) = handler.handle(record).await {
                error!(
                    handler = handler.name(),
                    partition_key = %record.partition_key,
                    sort_key = %record.sort_key,
                    error = %e,
                    "Change handler failed"
                );
                return Err(e);
            }
            handled += 1;
        }
        if handled == 0 {
            debug!(
                partition_key = %record.partition_key,
                sort_key = %record.sort_key,
                "No handler for change record"
            );
        }
        Ok(handled)
    }
}
