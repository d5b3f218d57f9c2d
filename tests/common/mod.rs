//! Shared utilities for integration tests.
//!
//! Builds a scope of managers over in-memory tables. The main table records
//! its change feed so tests can drive the postprocessor.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use socialgraph::config::Limits;
use socialgraph::models::user::User;
use socialgraph::postprocess::Postprocessor;
use socialgraph::registry::{Clients, Managers};
use socialgraph::storage::{MemoryStore, TableSchema, Tables};

pub struct TestScope {
    pub main: Arc<MemoryStore>,
    pub feed: Arc<MemoryStore>,
    pub managers: Managers,
}

impl TestScope {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        let main = Arc::new(MemoryStore::with_change_feed(TableSchema::main()));
        let feed = Arc::new(MemoryStore::new(TableSchema::feed()));
        let tables = Tables {
            main: main.clone(),
            feed: feed.clone(),
        };
        Self {
            main,
            feed,
            managers: Managers::new(Clients::new(tables, limits)),
        }
    }

    pub async fn user(&self, user_id: &str) -> User {
        self.managers
            .users()
            .add_user(user_id, user_id, at(0))
            .await
            .expect("Failed to add user")
    }

    pub async fn reload(&self, user_id: &str) -> User {
        self.managers
            .users()
            .get_user_with(user_id, true)
            .await
            .expect("Failed to read user")
            .expect("User should exist")
    }

    /// Dispatch change records until no handler writes anything new.
    pub async fn settle(&self, postprocessor: &Postprocessor) {
        loop {
            let changes = self.main.drain_changes().await;
            if changes.is_empty() {
                return;
            }
            for record in changes {
                postprocessor
                    .dispatch(&record)
                    .await
                    .expect("Postprocessing failed");
            }
        }
    }
}

/// A fixed instant plus `minutes`.
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}
