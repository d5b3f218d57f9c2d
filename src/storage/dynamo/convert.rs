//! JSON <-> DynamoDB attribute value conversion.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use serde_json::Value;

use crate::storage::Item;

/// Convert a single JSON value to a DynamoDB attribute value.
pub fn to_dynamo_value(value: Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s),
        Value::Array(values) => AttributeValue::L(values.into_iter().map(to_dynamo_value).collect()),
        Value::Object(map) => AttributeValue::M(
            map.into_iter()
                .map(|(k, v)| (k, to_dynamo_value(v)))
                .collect(),
        ),
    }
}

/// Convert a DynamoDB attribute value to JSON. Binary and set types have no
/// counterpart in this schema and become `null`.
pub fn from_dynamo_value(value: AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s),
        AttributeValue::N(n) => {
            if let Ok(i) = n.parse::<i64>() {
                Value::from(i)
            } else {
                n.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        AttributeValue::Bool(b) => Value::Bool(b),
        AttributeValue::L(values) => {
            Value::Array(values.into_iter().map(from_dynamo_value).collect())
        }
        AttributeValue::M(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, from_dynamo_value(v)))
                .collect(),
        ),
        AttributeValue::Ss(values) => Value::Array(values.into_iter().map(Value::String).collect()),
        _ => Value::Null,
    }
}

pub fn to_dynamo_item(item: Item) -> HashMap<String, AttributeValue> {
    item.into_iter()
        .map(|(k, v)| (k, to_dynamo_value(v)))
        .collect()
}

pub fn from_dynamo_item(item: HashMap<String, AttributeValue>) -> Item {
    item.into_iter()
        .map(|(k, v)| (k, from_dynamo_value(v)))
        .collect()
}
