//! Shared store contract tests.
//!
//! Tests the `Store` interface against every backend. Each backend's test
//! binary builds its tables and runs `run_store_tests!` on them.

pub mod store_contract_tests;
