//! Shared storage helper functions.
//!
//! Typed row conversion and timestamp encoding used by every repository.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::schema::{PARTITION_KEY, SORT_KEY};
use super::{Item, Key, Result, StoreError};

/// Serialize a typed row into an attribute map.
///
/// `None` fields are dropped rather than stored as nulls, so that sparse
/// index attributes stay absent.
pub fn to_item<T: Serialize>(row: &T) -> Result<Item> {
    match serde_json::to_value(row)? {
        Value::Object(map) => Ok(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
        other => Err(StoreError::Validation(format!(
            "row must serialize to an object, got {}",
            other
        ))),
    }
}

/// Serialize a typed row of the main table under `key`.
pub fn keyed_item<T: Serialize>(key: &Key, row: &T) -> Result<Item> {
    let mut item = to_item(row)?;
    item.insert(PARTITION_KEY.to_string(), Value::from(key.partition.clone()));
    item.insert(SORT_KEY.to_string(), Value::from(key.sort.clone()));
    Ok(item)
}

/// Deserialize an attribute map into a typed row.
pub fn from_item<T: DeserializeOwned>(item: Item) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(item.into_iter().collect()))?)
}

/// Encode a timestamp so that lexicographic order equals time order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Validation(format!("invalid timestamp `{}`: {}", value, e)))
}

/// Serde adapter storing `DateTime<Utc>` in the sortable [`timestamp`] form.
pub mod ts {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::timestamp(*at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let value = String::deserialize(deserializer)?;
        super::parse_timestamp(&value).map_err(serde::de::Error::custom)
    }

    /// Optional variant; pair with `#[serde(default)]`.
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            at: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => serializer.serialize_str(&super::super::timestamp(*at)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|value| super::super::parse_timestamp(&value).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Integer attribute, zero when absent.
pub fn count_of(item: Option<&Item>, attr: &str) -> i64 {
    item.and_then(|i| i.get(attr))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// The id segment of a `prefix/<id>` key.
pub fn key_id(key: &str) -> Option<&str> {
    key.split('/').nth(1).filter(|id| !id.is_empty())
}
