//! Socialgraph - denormalized social graph over a transactional key-value store
//!
//! Chats, memberships, feeds and their counters kept consistent with
//! bounded atomic transactions, idempotent fan-out and change-stream
//! reconciliation.

pub mod config;
pub mod counter;
pub mod models;
pub mod postprocess;
pub mod registry;
pub mod storage;
pub mod transact;
pub mod utils;
