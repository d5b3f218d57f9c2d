use serde_json::Value;

use super::*;
use crate::storage::ChangeKind;

fn row(partition: &str, sort: &str) -> Item {
    let mut item = Item::new();
    item.insert("partitionKey".to_string(), partition.into());
    item.insert("sortKey".to_string(), sort.into());
    item
}

#[tokio::test]
async fn test_change_feed_records_committed_writes() {
    let store = MemoryStore::with_change_feed(TableSchema::main());
    let key = Key::new("chat/c1", "member/u1");

    store.put(row("chat/c1", "member/u1"), None).await.unwrap();
    store
        .update(&key, vec![UpdateAction::add("messagesUnviewedCount", 1)], None)
        .await
        .unwrap();
    store.delete(&key, None).await.unwrap();

    let changes = store.drain_changes().await;
    let kinds: Vec<_> = changes.iter().map(|c| c.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            Some(ChangeKind::Insert),
            Some(ChangeKind::Modify),
            Some(ChangeKind::Remove)
        ]
    );
    assert_eq!(
        changes[1].new.as_ref().unwrap().get("messagesUnviewedCount"),
        Some(&Value::from(1))
    );
    assert!(store.drain_changes().await.is_empty());
}

#[tokio::test]
async fn test_deleting_absent_row_records_nothing() {
    let store = MemoryStore::with_change_feed(TableSchema::main());
    store
        .delete(&Key::new("chat/none", "-"), None)
        .await
        .unwrap();
    assert!(store.drain_changes().await.is_empty());
}

#[tokio::test]
async fn test_plain_store_records_no_changes() {
    let store = MemoryStore::new(TableSchema::main());
    store.put(row("chat/c1", "-"), None).await.unwrap();
    assert!(store.drain_changes().await.is_empty());
}

#[tokio::test]
async fn test_canceled_transaction_applies_nothing() {
    let store = MemoryStore::with_change_feed(TableSchema::main());
    store.put(row("user/u1", "profile"), None).await.unwrap();
    store.drain_changes().await;

    let result = store
        .transact_write(vec![
            PreparedWrite::put_if_absent(row("chat/c1", "-")),
            PreparedWrite::put_if_absent(row("user/u1", "profile")),
        ])
        .await;

    assert!(matches!(
        result,
        Err(StoreError::TransactionCanceled { index: Some(1) })
    ));
    assert!(store.get(&Key::new("chat/c1", "-"), true).await.unwrap().is_none());
    assert!(store.drain_changes().await.is_empty());
}

#[tokio::test]
async fn test_transaction_rejects_duplicate_keys() {
    let store = MemoryStore::new(TableSchema::main());
    let key = Key::new("chat/c1", "-");
    let result = store
        .transact_write(vec![
            PreparedWrite::put_if_absent(row("chat/c1", "-")),
            PreparedWrite::delete_if(key, Condition::Exists),
        ])
        .await;
    assert!(matches!(result, Err(StoreError::Validation(_))));
}

#[tokio::test]
async fn test_transaction_size_limit() {
    let store = MemoryStore::new(TableSchema::main());
    let writes = (0..=MAX_TRANSACT_ITEMS)
        .map(|i| PreparedWrite::put_if_absent(row(&format!("user/{}", i), "profile")))
        .collect();
    let result = store.transact_write(writes).await;
    assert!(matches!(result, Err(StoreError::TooManyItems { .. })));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_unavailable_is_retryable() {
    let store = MemoryStore::new(TableSchema::main());
    store.set_unavailable(true).await;
    let err = store
        .get(&Key::new("user/u1", "profile"), false)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(!err.is_condition_failure());

    store.set_unavailable(false).await;
    assert!(store
        .get(&Key::new("user/u1", "profile"), false)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_put_without_key_attributes_rejected() {
    let store = MemoryStore::new(TableSchema::feed());
    let result = store.put(row("chat/c1", "-"), None).await;
    assert!(matches!(result, Err(StoreError::Validation(_))));
}

#[tokio::test]
async fn test_unknown_index_rejected() {
    let store = MemoryStore::new(TableSchema::feed());
    let result = store
        .query_page(&Query::partition("u1").on_index("GSI-K1"), None)
        .await;
    assert!(matches!(result, Err(StoreError::Validation(_))));
}
