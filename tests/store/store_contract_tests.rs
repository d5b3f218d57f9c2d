//! Store interface tests.
//!
//! These tests verify the contract of the Store trait on the main table
//! layout. Every test works in its own partitions, so a shared table can be
//! reused across tests.

use futures::TryStreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use socialgraph::storage::schema::{GSI_A1, GSI_A1_PARTITION_KEY, GSI_A1_SORT_KEY};
use socialgraph::storage::{
    Condition, Item, Key, PreparedWrite, Query, Store, StoreError, UpdateAction,
};

/// A partition key unique to one test run.
pub fn partition(prefix: &str) -> String {
    format!("{}/{}", prefix, Uuid::new_v4())
}

pub fn row(key: &Key, attrs: &[(&str, Value)]) -> Item {
    let mut item: Item = attrs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    item.insert("partitionKey".to_string(), json!(key.partition));
    item.insert("sortKey".to_string(), json!(key.sort));
    item
}

// =============================================================================
// Single-row operations
// =============================================================================

pub async fn test_get_missing<S: Store + ?Sized>(store: &S) {
    let key = Key::new(partition("user"), "profile");
    let found = store.get(&key, true).await.expect("get should succeed");
    assert!(found.is_none(), "missing row should be None");
}

pub async fn test_put_if_absent<S: Store + ?Sized>(store: &S) {
    let key = Key::new(partition("user"), "profile");
    store
        .put(row(&key, &[("username", json!("alice"))]), Some(Condition::NotExists))
        .await
        .expect("first put should succeed");

    let err = store
        .put(row(&key, &[("username", json!("bob"))]), Some(Condition::NotExists))
        .await
        .expect_err("second put should fail");
    assert!(matches!(err, StoreError::ConditionFailed { .. }));

    let found = store.get(&key, true).await.unwrap().expect("row should exist");
    assert_eq!(found.get("username"), Some(&json!("alice")));
}

pub async fn test_update_counters<S: Store + ?Sized>(store: &S) {
    let key = Key::new(partition("chat"), "-");
    store
        .put(row(&key, &[("userCount", json!(1))]), None)
        .await
        .unwrap();

    let updated = store
        .update(
            &key,
            vec![
                UpdateAction::add("userCount", 2),
                UpdateAction::add("messagesCount", 1),
                UpdateAction::set("name", "friends"),
            ],
            Some(Condition::Exists),
        )
        .await
        .expect("update should succeed");
    assert_eq!(updated.get("userCount"), Some(&json!(3)));
    assert_eq!(updated.get("messagesCount"), Some(&json!(1)));
    assert_eq!(updated.get("name"), Some(&json!("friends")));

    let err = store
        .update(
            &key,
            vec![UpdateAction::add("userCount", -4)],
            Some(Condition::at_least("userCount", 4)),
        )
        .await
        .expect_err("floor should reject");
    assert!(err.is_condition_failure());

    let removed = store
        .update(&key, vec![UpdateAction::Remove("name".to_string())], None)
        .await
        .unwrap();
    assert!(!removed.contains_key("name"));
}

pub async fn test_update_missing_row<S: Store + ?Sized>(store: &S) {
    let key = Key::new(partition("user"), "profile");
    let err = store
        .update(&key, vec![UpdateAction::add("chatCount", 1)], Some(Condition::Exists))
        .await
        .expect_err("update of missing row should fail");
    assert!(matches!(err, StoreError::ConditionFailed { .. }));
    assert!(store.get(&key, true).await.unwrap().is_none());
}

pub async fn test_missing_or_before<S: Store + ?Sized>(store: &S) {
    let key = Key::new(partition("chat"), "-");
    store.put(row(&key, &[]), None).await.unwrap();

    let set = |at: &str| {
        (
            vec![UpdateAction::set("lastMessageActivityAt", at)],
            Some(Condition::missing_or_before("lastMessageActivityAt", at)),
        )
    };

    let (actions, condition) = set("2024-01-02T00:00:00.000000Z");
    store.update(&key, actions, condition).await.expect("missing attribute");
    let (actions, condition) = set("2024-01-01T00:00:00.000000Z");
    let err = store.update(&key, actions, condition).await.unwrap_err();
    assert!(err.is_condition_failure());
    let (actions, condition) = set("2024-01-03T00:00:00.000000Z");
    store.update(&key, actions, condition).await.expect("newer value");

    let found = store.get(&key, true).await.unwrap().unwrap();
    assert_eq!(
        found.get("lastMessageActivityAt"),
        Some(&json!("2024-01-03T00:00:00.000000Z"))
    );
}

pub async fn test_delete_returns_old<S: Store + ?Sized>(store: &S) {
    let key = Key::new(partition("block"), "-");
    store.put(row(&key, &[("n", json!(7))]), None).await.unwrap();

    let old = store
        .delete(&key, Some(Condition::Exists))
        .await
        .expect("delete should succeed")
        .expect("old row should be returned");
    assert_eq!(old.get("n"), Some(&json!(7)));

    let gone = store.delete(&key, None).await.expect("delete is idempotent");
    assert!(gone.is_none());

    let err = store
        .delete(&key, Some(Condition::Exists))
        .await
        .expect_err("conditional delete of missing row should fail");
    assert!(err.is_condition_failure());
}

// =============================================================================
// Transactions
// =============================================================================

pub async fn test_transaction_commits_all<S: Store + ?Sized>(store: &S) {
    let chat = Key::new(partition("chat"), "-");
    let member = Key::new(chat.partition.clone(), "member/u1");
    let user = Key::new(partition("user"), "profile");
    store.put(row(&user, &[("chatCount", json!(0))]), None).await.unwrap();

    store
        .transact_write(vec![
            PreparedWrite::put_if_absent(row(&chat, &[("userCount", json!(1))])),
            PreparedWrite::put_if_absent(row(&member, &[])),
            PreparedWrite::update_if_exists(
                user.clone(),
                vec![UpdateAction::add("chatCount", 1)],
                None,
            ),
        ])
        .await
        .expect("transaction should commit");

    assert!(store.get(&chat, true).await.unwrap().is_some());
    assert!(store.get(&member, true).await.unwrap().is_some());
    let user = store.get(&user, true).await.unwrap().unwrap();
    assert_eq!(user.get("chatCount"), Some(&json!(1)));
}

pub async fn test_transaction_names_failed_write<S: Store + ?Sized>(store: &S) {
    let chat = Key::new(partition("chat"), "-");
    let missing_user = Key::new(partition("user"), "profile");

    let err = store
        .transact_write(vec![
            PreparedWrite::put_if_absent(row(&chat, &[])),
            PreparedWrite::update_if_exists(
                missing_user,
                vec![UpdateAction::add("chatCount", 1)],
                None,
            ),
        ])
        .await
        .expect_err("transaction should be canceled");
    assert!(matches!(err, StoreError::TransactionCanceled { index: Some(1) }));
    assert!(
        store.get(&chat, true).await.unwrap().is_none(),
        "no write of a canceled transaction may be visible"
    );
}

pub async fn test_transaction_delete_if<S: Store + ?Sized>(store: &S) {
    let chat = Key::new(partition("chat"), "-");
    store.put(row(&chat, &[("userCount", json!(2))]), None).await.unwrap();

    let err = store
        .transact_write(vec![PreparedWrite::delete_if(
            chat.clone(),
            Condition::equals("userCount", 0),
        )])
        .await
        .expect_err("stale count should cancel");
    assert!(matches!(err, StoreError::TransactionCanceled { index: Some(0) }));

    store
        .transact_write(vec![PreparedWrite::delete_if(
            chat.clone(),
            Condition::equals("userCount", 2),
        )])
        .await
        .expect("matching count should delete");
    assert!(store.get(&chat, true).await.unwrap().is_none());
}

// =============================================================================
// Batch writes
// =============================================================================

pub async fn test_batch_put_and_delete<S: Store + ?Sized>(store: &S) {
    let post = partition("post");
    let keys: Vec<Key> = (0..30)
        .map(|i| Key::new(post.clone(), format!("feed/u{:02}", i)))
        .collect();
    let items: Vec<Item> = keys.iter().map(|k| row(k, &[])).collect();

    store.batch_put(items.clone()).await.expect("batch put");
    store.batch_put(items).await.expect("batch put is idempotent");
    let rows: Vec<Item> = store
        .query_stream(Query::partition(post.clone()))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(rows.len(), 30);

    store.batch_delete(keys.clone()).await.expect("batch delete");
    store.batch_delete(keys).await.expect("batch delete is idempotent");
    let rows: Vec<Item> = store
        .query_stream(Query::partition(post))
        .try_collect()
        .await
        .unwrap();
    assert!(rows.is_empty());
}

// =============================================================================
// Queries
// =============================================================================

pub async fn test_query_sort_prefix_and_order<S: Store + ?Sized>(store: &S) {
    let chat = partition("chat");
    for sort in ["-", "member/u1", "member/u2", "member/u3", "view/u1"] {
        store
            .put(row(&Key::new(chat.clone(), sort), &[]), None)
            .await
            .unwrap();
    }

    let sorts = |rows: Vec<Item>| -> Vec<String> {
        rows.iter()
            .filter_map(|r| r.get("sortKey").and_then(Value::as_str).map(String::from))
            .collect()
    };

    let members: Vec<Item> = store
        .query_stream(Query::partition(chat.clone()).sort_begins_with("member/"))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(sorts(members), vec!["member/u1", "member/u2", "member/u3"]);

    let reversed: Vec<Item> = store
        .query_stream(
            Query::partition(chat.clone())
                .sort_begins_with("member/")
                .descending(),
        )
        .try_collect()
        .await
        .unwrap();
    assert_eq!(sorts(reversed), vec!["member/u3", "member/u2", "member/u1"]);

    let exact: Vec<Item> = store
        .query_stream(Query::partition(chat).sort_equals("view/u1"))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(exact.len(), 1);
}

pub async fn test_query_pagination<S: Store + ?Sized>(store: &S) {
    let chat = partition("chat");
    for i in 0..5 {
        store
            .put(row(&Key::new(chat.clone(), format!("member/u{}", i)), &[]), None)
            .await
            .unwrap();
    }

    let query = Query::partition(chat).limit(2);
    let first = store.query_page(&query, None).await.expect("first page");
    assert_eq!(first.items.len(), 2);
    let token = first.next.expect("more pages");
    let second = store.query_page(&query, Some(token)).await.expect("second page");
    assert_eq!(second.items.len(), 2);
    assert_ne!(first.items[0].get("sortKey"), second.items[0].get("sortKey"));

    let all: Vec<Item> = store.query_stream(query).try_collect().await.unwrap();
    assert_eq!(all.len(), 5);
}

pub async fn test_query_index_with_projection<S: Store + ?Sized>(store: &S) {
    let feed = partition("feed");
    for (post, at) in [("p1", "2024-01-01"), ("p2", "2024-01-03"), ("p3", "2024-01-02")] {
        let key = Key::new(format!("post/{}/{}", post, Uuid::new_v4()), feed.clone());
        store
            .put(
                row(
                    &key,
                    &[
                        (GSI_A1_PARTITION_KEY, json!(feed)),
                        (GSI_A1_SORT_KEY, json!(at)),
                        ("postId", json!(post)),
                    ],
                ),
                None,
            )
            .await
            .unwrap();
    }
    // sparse: not indexed without the sort attribute
    store
        .put(
            row(
                &Key::new(partition("post"), feed.clone()),
                &[(GSI_A1_PARTITION_KEY, json!(feed))],
            ),
            None,
        )
        .await
        .unwrap();

    let rows: Vec<Item> = store
        .query_stream(
            Query::partition(feed)
                .on_index(GSI_A1)
                .descending()
                .project(&["postId"]),
        )
        .try_collect()
        .await
        .unwrap();
    let post_ids: Vec<_> = rows
        .iter()
        .filter_map(|r| r.get("postId").and_then(Value::as_str))
        .collect();
    assert_eq!(post_ids, vec!["p2", "p3", "p1"]);
    assert!(rows.iter().all(|r| !r.contains_key(GSI_A1_SORT_KEY)));
}

/// Run every store contract test against one backend.
#[macro_export]
macro_rules! run_store_tests {
    ($store:expr) => {
        use $crate::store::store_contract_tests::*;

        // single-row tests
        test_get_missing($store).await;
        println!("  test_get_missing: PASSED");

        test_put_if_absent($store).await;
        println!("  test_put_if_absent: PASSED");

        test_update_counters($store).await;
        println!("  test_update_counters: PASSED");

        test_update_missing_row($store).await;
        println!("  test_update_missing_row: PASSED");

        test_missing_or_before($store).await;
        println!("  test_missing_or_before: PASSED");

        test_delete_returns_old($store).await;
        println!("  test_delete_returns_old: PASSED");

        // transaction tests
        test_transaction_commits_all($store).await;
        println!("  test_transaction_commits_all: PASSED");

        test_transaction_names_failed_write($store).await;
        println!("  test_transaction_names_failed_write: PASSED");

        test_transaction_delete_if($store).await;
        println!("  test_transaction_delete_if: PASSED");

        // batch tests
        test_batch_put_and_delete($store).await;
        println!("  test_batch_put_and_delete: PASSED");

        // query tests
        test_query_sort_prefix_and_order($store).await;
        println!("  test_query_sort_prefix_and_order: PASSED");

        test_query_pagination($store).await;
        println!("  test_query_pagination: PASSED");

        test_query_index_with_projection($store).await;
        println!("  test_query_index_with_projection: PASSED");
    };
}
