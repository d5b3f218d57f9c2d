//! Notification cards.
//!
//! A card is a per-user prompt shown until it is acted on. Cards are keyed
//! by a deterministic id derived from their spec, so adding and removing
//! them is idempotent.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::helpers::{from_item, keyed_item, timestamp, ts};
use crate::storage::{Condition, Key, Result, Store, StoreError};

/// Kind of card; one card of each kind per user at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardKind {
    ChatActivity,
}

impl CardKind {
    fn as_str(self) -> &'static str {
        match self {
            CardKind::ChatActivity => "CHAT_ACTIVITY",
        }
    }
}

/// Identifies one card of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardSpec {
    pub user_id: String,
    pub kind: CardKind,
}

impl CardSpec {
    /// "You have new chat messages".
    pub fn chat_activity(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            kind: CardKind::ChatActivity,
        }
    }

    pub fn card_id(&self) -> String {
        format!("{}:{}", self.user_id, self.kind.as_str())
    }

    pub fn title(&self) -> &'static str {
        match self.kind {
            CardKind::ChatActivity => "You have new messages",
        }
    }

    pub fn action(&self) -> &'static str {
        match self.kind {
            CardKind::ChatActivity => "https://real.app/chat/",
        }
    }
}

/// `card/<cardId>` | `-`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub card_id: String,
    pub user_id: String,
    pub kind: CardKind,
    pub title: String,
    pub action: String,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    /// `user/<userId>`
    pub gsi_a1_partition_key: String,
    /// `card/<createdAt>`
    pub gsi_a1_sort_key: String,
}

#[derive(Clone)]
pub struct CardRepository {
    store: Arc<dyn Store>,
}

impl CardRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn key(spec: &CardSpec) -> Key {
        Key::new(format!("card/{}", spec.card_id()), "-")
    }

    pub async fn get_card(&self, spec: &CardSpec) -> Result<Option<Card>> {
        self.store
            .get(&Self::key(spec), false)
            .await?
            .map(from_item)
            .transpose()
    }

    /// Create the card unless it exists. Returns whether it was created.
    pub async fn add_card_if_absent(&self, spec: &CardSpec, now: DateTime<Utc>) -> Result<bool> {
        let card = Card {
            card_id: spec.card_id(),
            user_id: spec.user_id.clone(),
            kind: spec.kind,
            title: spec.title().to_string(),
            action: spec.action().to_string(),
            created_at: now,
            gsi_a1_partition_key: format!("user/{}", spec.user_id),
            gsi_a1_sort_key: format!("card/{}", timestamp(now)),
        };
        let item = keyed_item(&Self::key(spec), &card)?;
        match self.store.put(item, Some(Condition::NotExists)).await {
            Ok(()) => Ok(true),
            Err(StoreError::ConditionFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete the card if present. Returns whether it existed.
    pub async fn remove_card_if_exists(&self, spec: &CardSpec) -> Result<bool> {
        Ok(self.store.delete(&Self::key(spec), None).await?.is_some())
    }
}
