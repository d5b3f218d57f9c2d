//! Change-feed records.
//!
//! A record is the before/after snapshot of one committed row write. Delivery
//! is at-least-once and ordered only within a partition key.

use serde::{Deserialize, Serialize};

use super::Item;

/// Kind of committed write a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// Before/after snapshot of one committed row write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub partition_key: String,
    pub sort_key: String,
    #[serde(default)]
    pub old: Option<Item>,
    #[serde(default)]
    pub new: Option<Item>,
}

impl ChangeRecord {
    pub fn new(
        partition_key: impl Into<String>,
        sort_key: impl Into<String>,
        old: Option<Item>,
        new: Option<Item>,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
            old,
            new,
        }
    }

    /// `None` when both snapshots are absent, which no committed write produces.
    pub fn kind(&self) -> Option<ChangeKind> {
        match (&self.old, &self.new) {
            (None, Some(_)) => Some(ChangeKind::Insert),
            (Some(_), Some(_)) => Some(ChangeKind::Modify),
            (Some(_), None) => Some(ChangeKind::Remove),
            (None, None) => None,
        }
    }
}
