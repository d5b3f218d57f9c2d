//! Expression rendering with placeholder names and values.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use serde_json::Value;

use super::convert::to_dynamo_value;
use crate::storage::{Condition, TableSchema, UpdateAction};

/// Accumulates `#n`/`:v` placeholders for one request.
pub(crate) struct Expr<'a> {
    schema: &'a TableSchema,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl<'a> Expr<'a> {
    pub(crate) fn new(schema: &'a TableSchema) -> Self {
        Self {
            schema,
            names: HashMap::new(),
            values: HashMap::new(),
        }
    }

    /// Placeholder for an attribute name, reused if already registered.
    pub(crate) fn name(&mut self, attr: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, name)| *name == attr) {
            return placeholder.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attr.to_string());
        placeholder
    }

    pub(crate) fn value(&mut self, value: Value) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values
            .insert(placeholder.clone(), to_dynamo_value(value));
        placeholder
    }

    pub(crate) fn condition(&mut self, condition: &Condition) -> String {
        match condition {
            Condition::Exists => {
                let pk = self.schema.partition_key.clone();
                format!("attribute_exists({})", self.name(&pk))
            }
            Condition::NotExists => {
                let pk = self.schema.partition_key.clone();
                format!("attribute_not_exists({})", self.name(&pk))
            }
            Condition::Equals(attr, value) => {
                format!("{} = {}", self.name(attr), self.value(value.clone()))
            }
            Condition::AtLeast(attr, bound) => {
                format!("{} >= {}", self.name(attr), self.value(Value::from(*bound)))
            }
            Condition::LessThan(attr, value) => {
                format!("{} < {}", self.name(attr), self.value(value.clone()))
            }
            Condition::AttributeNotExists(attr) => {
                format!("attribute_not_exists({})", self.name(attr))
            }
            Condition::And(conditions) => self.join(conditions, " AND "),
            Condition::Or(conditions) => self.join(conditions, " OR "),
        }
    }

    fn join(&mut self, conditions: &[Condition], separator: &str) -> String {
        conditions
            .iter()
            .map(|c| format!("({})", self.condition(c)))
            .collect::<Vec<_>>()
            .join(separator)
    }

    pub(crate) fn update(&mut self, actions: &[UpdateAction]) -> String {
        let mut sets = Vec::new();
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        for action in actions {
            match action {
                UpdateAction::Set(attr, value) => {
                    sets.push(format!("{} = {}", self.name(attr), self.value(value.clone())))
                }
                UpdateAction::Add(attr, amount) => {
                    adds.push(format!("{} {}", self.name(attr), self.value(Value::from(*amount))))
                }
                UpdateAction::Remove(attr) => removes.push(self.name(attr)),
            }
        }

        [("SET", sets), ("ADD", adds), ("REMOVE", removes)]
            .into_iter()
            .filter(|(_, clauses)| !clauses.is_empty())
            .map(|(verb, clauses)| format!("{} {}", verb, clauses.join(", ")))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Registered names, `None` when empty (DynamoDB rejects empty maps).
    pub(crate) fn names(&self) -> Option<HashMap<String, String>> {
        (!self.names.is_empty()).then(|| self.names.clone())
    }

    pub(crate) fn values(&self) -> Option<HashMap<String, AttributeValue>> {
        (!self.values.is_empty()).then(|| self.values.clone())
    }
}
