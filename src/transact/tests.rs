use serde_json::json;

use super::*;
use crate::storage::{Item, Key, MemoryStore, TableSchema};

#[derive(Debug, thiserror::Error)]
enum TestError {
    #[error("duplicate {0}")]
    Duplicate(&'static str),
    #[error(transparent)]
    Failure(#[from] TransactFailure),
}

fn row(pk: &str) -> Item {
    [
        ("partitionKey".to_string(), json!(pk)),
        ("sortKey".to_string(), json!("-")),
    ]
    .into_iter()
    .collect()
}

fn coordinator(max: usize) -> (Arc<MemoryStore>, TransactionCoordinator) {
    let store = Arc::new(MemoryStore::new(TableSchema::main()));
    let coordinator = TransactionCoordinator::new(store.clone(), max);
    (store, coordinator)
}

#[tokio::test]
async fn test_commit_applies_all_writes() {
    let (store, coordinator) = coordinator(25);
    let plan = TransactPlan::<TestError>::new()
        .with(PreparedWrite::put_if_absent(row("chat/a")), None)
        .with(PreparedWrite::put_if_absent(row("chat/b")), None);

    coordinator.commit(plan).await.unwrap();
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_rejection_maps_positionally() {
    let (store, coordinator) = coordinator(25);
    store.put(row("chat/b"), None).await.unwrap();

    let plan = TransactPlan::new()
        .with(
            PreparedWrite::put_if_absent(row("chat/a")),
            Some(TestError::Duplicate("a")),
        )
        .with(
            PreparedWrite::put_if_absent(row("chat/b")),
            Some(TestError::Duplicate("b")),
        );

    let err = coordinator.commit(plan).await.unwrap_err();
    assert!(matches!(err, TransactError::Rejected(TestError::Duplicate("b"))));
    assert!(store.get(&Key::new("chat/a", "-"), true).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejection_without_registered_error_carries_index() {
    let (store, coordinator) = coordinator(25);
    store.put(row("chat/a"), None).await.unwrap();

    let plan = TransactPlan::<TestError>::new()
        .with(PreparedWrite::put_if_absent(row("chat/a")), None);

    let err = coordinator.commit(plan).await.unwrap_err();
    assert!(matches!(err, TransactError::ConditionFailed { index: Some(0) }));
    assert!(!err.is_retryable());
    assert!(matches!(
        err.into_domain(),
        TestError::Failure(TransactError::ConditionFailed { index: Some(0) })
    ));
}

#[tokio::test]
async fn test_plan_over_bound_is_refused() {
    let (store, coordinator) = coordinator(2);
    let plan = TransactPlan::<TestError>::new()
        .with(PreparedWrite::put_if_absent(row("chat/a")), None)
        .with(PreparedWrite::put_if_absent(row("chat/b")), None)
        .with(PreparedWrite::put_if_absent(row("chat/c")), None);

    let err = coordinator.commit(plan).await.unwrap_err();
    assert!(matches!(err, TransactError::TooManyWrites { count: 3, max: 2 }));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_empty_plan_is_noop() {
    let (_, coordinator) = coordinator(25);
    coordinator
        .commit(TransactPlan::<TestError>::new())
        .await
        .unwrap();
}

#[test]
fn test_from_parts_requires_alignment() {
    let err = TransactPlan::<TestError>::from_parts(
        vec![PreparedWrite::put_if_absent(row("chat/a"))],
        vec![],
    )
    .unwrap_err();
    assert!(matches!(err, TransactError::Misaligned { writes: 1, errors: 0 }));
}

#[tokio::test]
async fn test_unavailable_store_is_retryable() {
    let (store, coordinator) = coordinator(25);
    store.set_unavailable(true).await;
    let plan = TransactPlan::<TestError>::new()
        .with(PreparedWrite::put_if_absent(row("chat/a")), None);

    let err = coordinator.commit(plan).await.unwrap_err();
    assert!(err.is_retryable());
}
