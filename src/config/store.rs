//! Store configuration types.

use serde::Deserialize;

/// Default main table name.
pub const DEFAULT_MAIN_TABLE: &str = "main";
/// Default feed table name.
pub const DEFAULT_FEED_TABLE: &str = "feed";
/// Default per-call store timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Store backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Memory,
    Dynamo,
}

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend discriminator.
    #[serde(rename = "type")]
    pub store_type: StoreType,
    /// Main entity table.
    pub table_name: String,
    /// Feed projection table.
    pub feed_table_name: String,
    /// Endpoint override (DynamoDB Local).
    pub endpoint_url: Option<String>,
    /// Bound on every store call.
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::Memory,
            table_name: DEFAULT_MAIN_TABLE.to_string(),
            feed_table_name: DEFAULT_FEED_TABLE.to_string(),
            endpoint_url: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}
