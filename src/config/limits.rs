//! Store request limits.
//!
//! DynamoDB caps a transaction at 100 items and a batch write at 25
//! requests. The transaction default stays at 25 so that every lifecycle
//! transaction fits on any backend.

use serde::Deserialize;

/// Default maximum writes per transaction.
pub const DEFAULT_MAX_TRANSACT_ITEMS: usize = 25;

/// Default requests per batch write.
pub const DEFAULT_BATCH_WRITE_SIZE: usize = 25;

/// Store request limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum writes the coordinator submits in one transaction.
    pub max_transact_items: usize,

    /// Rows per batch put/delete call issued by the feed engine and
    /// message truncation.
    pub batch_write_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_transact_items: DEFAULT_MAX_TRANSACT_ITEMS,
            batch_write_size: DEFAULT_BATCH_WRITE_SIZE,
        }
    }
}
