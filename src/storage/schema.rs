//! Table layouts.
//!
//! Main table:
//! - PK: `partitionKey`, SK: `sortKey` (String)
//! - `GSI-A1`: `gsiA1PartitionKey` / `gsiA1SortKey` (time-ordered access)
//! - `GSI-A2`: `gsiA2PartitionKey` / `gsiA2SortKey` (by-author access)
//! - `GSI-K1`: `gsiK1PartitionKey` / `gsiK1SortKey` (memberships by user)
//!
//! Feed table:
//! - PK: `postId`, SK: `feedUserId`
//! - `GSI-A1`: `feedUserId` / `postedAt`
//! - `GSI-A2`: `feedUserId` / `postedByUserId`
//!
//! Indexes are sparse: rows lacking either index attribute are not indexed.

use super::{Item, Key};

pub const PARTITION_KEY: &str = "partitionKey";
pub const SORT_KEY: &str = "sortKey";

pub const GSI_A1: &str = "GSI-A1";
pub const GSI_A2: &str = "GSI-A2";
pub const GSI_K1: &str = "GSI-K1";

pub const GSI_A1_PARTITION_KEY: &str = "gsiA1PartitionKey";
pub const GSI_A1_SORT_KEY: &str = "gsiA1SortKey";
pub const GSI_A2_PARTITION_KEY: &str = "gsiA2PartitionKey";
pub const GSI_A2_SORT_KEY: &str = "gsiA2SortKey";
pub const GSI_K1_PARTITION_KEY: &str = "gsiK1PartitionKey";
pub const GSI_K1_SORT_KEY: &str = "gsiK1SortKey";

/// Key attribute names of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: String,
    pub partition_key: String,
    pub sort_key: String,
}

impl IndexSchema {
    pub fn new(name: &str, partition_key: &str, sort_key: &str) -> Self {
        Self {
            name: name.to_string(),
            partition_key: partition_key.to_string(),
            sort_key: sort_key.to_string(),
        }
    }
}

/// Key attribute names and indexes of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub partition_key: String,
    pub sort_key: String,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    /// The main entity table.
    pub fn main() -> Self {
        Self {
            partition_key: PARTITION_KEY.to_string(),
            sort_key: SORT_KEY.to_string(),
            indexes: vec![
                IndexSchema::new(GSI_A1, GSI_A1_PARTITION_KEY, GSI_A1_SORT_KEY),
                IndexSchema::new(GSI_A2, GSI_A2_PARTITION_KEY, GSI_A2_SORT_KEY),
                IndexSchema::new(GSI_K1, GSI_K1_PARTITION_KEY, GSI_K1_SORT_KEY),
            ],
        }
    }

    /// The feed projection table.
    pub fn feed() -> Self {
        Self {
            partition_key: "postId".to_string(),
            sort_key: "feedUserId".to_string(),
            indexes: vec![
                IndexSchema::new(GSI_A1, "feedUserId", "postedAt"),
                IndexSchema::new(GSI_A2, "feedUserId", "postedByUserId"),
            ],
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|index| index.name == name)
    }

    /// Extract the primary key of an item, if both key attributes are strings.
    pub fn key_of(&self, item: &Item) -> Option<Key> {
        let partition = item.get(&self.partition_key)?.as_str()?;
        let sort = item.get(&self.sort_key)?.as_str()?;
        Some(Key::new(partition, sort))
    }

    /// Key attributes as an item fragment.
    pub fn key_item(&self, key: &Key) -> Item {
        let mut item = Item::new();
        item.insert(self.partition_key.clone(), key.partition.clone().into());
        item.insert(self.sort_key.clone(), key.sort.clone().into());
        item
    }

    /// Every attribute that participates in the table or index keys.
    pub fn key_attributes(&self) -> Vec<&str> {
        let mut attrs = vec![self.partition_key.as_str(), self.sort_key.as_str()];
        for index in &self.indexes {
            for attr in [index.partition_key.as_str(), index.sort_key.as_str()] {
                if !attrs.contains(&attr) {
                    attrs.push(attr);
                }
            }
        }
        attrs
    }
}
