use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::TryStreamExt;
use serde_json::json;

use super::*;
use crate::config::Limits;
use crate::models::card::CardSpec;
use crate::models::user::User;
use crate::models::view::{ViewedStatus, Viewable};
use crate::registry::{Clients, Managers};
use crate::storage::{Item, Key, MemoryStore, Store, TableSchema, Tables};

struct Fixture {
    main: Arc<MemoryStore>,
    managers: Managers,
}

impl Fixture {
    fn new() -> Self {
        let main = Arc::new(MemoryStore::new(TableSchema::main()));
        let tables = Tables {
            main: main.clone(),
            feed: Arc::new(MemoryStore::new(TableSchema::feed())),
        };
        Self {
            main,
            managers: Managers::new(Clients::new(tables, Limits::default())),
        }
    }

    async fn user(&self, user_id: &str) -> User {
        self.managers
            .users()
            .add_user(user_id, &format!("{}name", user_id), now())
            .await
            .unwrap()
    }

    async fn chat_count(&self, user_id: &str) -> i64 {
        self.managers
            .users()
            .get_user_with(user_id, true)
            .await
            .unwrap()
            .unwrap()
            .chat_count
    }

    async fn message_texts(&self, chat_id: &str) -> Vec<String> {
        let messages: Vec<_> = self
            .managers
            .chat_messages()
            .messages()
            .messages_by_chat(chat_id)
            .try_collect()
            .await
            .unwrap();
        messages.into_iter().map(|m| m.text).collect()
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

#[tokio::test]
async fn test_add_direct_chat() {
    let fx = Fixture::new();
    fx.user("u1").await;
    fx.user("u2").await;
    let chats = fx.managers.chats();

    let chat = chats.add_direct_chat("c1", "u1", "u2", now()).await.unwrap();
    assert_eq!(chat.chat_type(), ChatType::Direct);
    assert_eq!(chat.row.user_count, 2);
    assert_eq!(chat.row.direct_user_ids(), Some(("u1", "u2")));
    assert!(chat.is_member("u1").await.unwrap());
    assert!(chat.is_member("u2").await.unwrap());
    assert_eq!(fx.chat_count("u1").await, 1);
    assert_eq!(fx.chat_count("u2").await, 1);

    let found = chats.get_direct_chat("u2", "u1").await.unwrap().unwrap();
    assert_eq!(found.id(), "c1");
}

#[tokio::test]
async fn test_add_direct_chat_rejections() {
    let fx = Fixture::new();
    fx.user("u1").await;
    fx.user("u2").await;
    fx.user("u3").await;
    let chats = fx.managers.chats();

    let err = chats.add_direct_chat("c1", "u1", "u1", now()).await.unwrap_err();
    assert!(matches!(err, ChatError::SelfChat(_)));

    chats.add_direct_chat("c1", "u1", "u2", now()).await.unwrap();
    let err = chats.add_direct_chat("c2", "u2", "u1", now()).await.unwrap_err();
    assert!(matches!(err, ChatError::DirectChatExists { .. }));

    let err = chats.add_direct_chat("c1", "u1", "u3", now()).await.unwrap_err();
    assert!(matches!(err, ChatError::ChatIdUsed(id) if id == "c1"));

    let err = chats.add_direct_chat("c3", "u1", "nobody", now()).await.unwrap_err();
    assert!(matches!(err, ChatError::UserNotFound(id) if id == "nobody"));
    assert!(chats.get_chat_with("c3", true).await.unwrap().is_none());
    assert_eq!(fx.chat_count("u1").await, 1);
}

#[tokio::test]
async fn test_add_direct_chat_blocked_either_way() {
    let fx = Fixture::new();
    fx.user("u1").await;
    fx.user("u2").await;
    fx.managers.blocks().block("u2", "u1", now()).await.unwrap();

    let err = fx
        .managers
        .chats()
        .add_direct_chat("c1", "u1", "u2", now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChatError::Blocked { ref blocker_user_id, .. } if blocker_user_id == "u2"
    ));
}

#[tokio::test]
async fn test_add_group_chat_posts_system_message() {
    let fx = Fixture::new();
    let u1 = fx.user("u1").await;

    let chat = fx
        .managers
        .chats()
        .add_group_chat("g1", &u1, Some("friends"), now())
        .await
        .unwrap();
    assert_eq!(chat.row.user_count, 1);
    assert_eq!(chat.row.name.as_deref(), Some("friends"));
    assert_eq!(fx.chat_count("u1").await, 1);
    assert_eq!(
        fx.message_texts("g1").await,
        vec!["@u1name created the group \"friends\""]
    );
}

#[tokio::test]
async fn test_add_users_is_idempotent() {
    let fx = Fixture::new();
    let u1 = fx.user("u1").await;
    fx.user("u2").await;
    fx.user("u3").await;
    fx.user("u4").await;
    fx.managers.blocks().block("u4", "u1", now()).await.unwrap();
    let chats = fx.managers.chats();
    let mut chat = chats.add_group_chat("g1", &u1, None, now()).await.unwrap();

    let requested = ids(&["u2", "u3", "u2", "u1", "u4", "ghost"]);
    let added = chat.add(&u1, &requested, now()).await.unwrap();
    let added_ids: Vec<_> = added.iter().map(|u| u.user_id.as_str()).collect();
    assert_eq!(added_ids, vec!["u2", "u3"]);
    assert_eq!(chat.row.user_count, 3);

    let added = chat.add(&u1, &requested, now()).await.unwrap();
    assert!(added.is_empty());
    chat.refresh(true).await.unwrap();
    assert_eq!(chat.row.user_count, 3);
    assert_eq!(fx.chat_count("u2").await, 1);

    let texts = fx.message_texts("g1").await;
    assert_eq!(texts.len(), 2);
    assert!(texts.contains(&"@u1name added @u2name and @u3name to the group".to_string()));
}

#[tokio::test]
async fn test_leave_keeps_chat_until_last_member() {
    let fx = Fixture::new();
    let u1 = fx.user("u1").await;
    let u2 = fx.user("u2").await;
    let chats = fx.managers.chats();
    let mut chat = chats.add_group_chat("g1", &u1, None, now()).await.unwrap();
    chat.add(&u1, &ids(&["u2"]), now()).await.unwrap();

    let outcome = chat.leave(&u2, now()).await.unwrap();
    assert_eq!(outcome, LeaveOutcome::Left);
    assert_eq!(chat.row.user_count, 1);
    assert_eq!(fx.chat_count("u2").await, 0);
    let texts = fx.message_texts("g1").await;
    assert_eq!(
        texts.iter().filter(|t| *t == "@u2name left the group").count(),
        1
    );

    let outcome = chat.leave(&u1, now()).await.unwrap();
    assert_eq!(outcome, LeaveOutcome::Deleted);
    assert!(chats.get_chat_with("g1", true).await.unwrap().is_none());
    assert!(fx.message_texts("g1").await.is_empty());
    assert_eq!(fx.main.len().await, 2);
}

#[tokio::test]
async fn test_leave_by_non_member() {
    let fx = Fixture::new();
    let u1 = fx.user("u1").await;
    let u2 = fx.user("u2").await;
    let mut chat = fx
        .managers
        .chats()
        .add_group_chat("g1", &u1, None, now())
        .await
        .unwrap();

    let err = chat.leave(&u2, now()).await.unwrap_err();
    assert!(matches!(err, ChatError::NotMember { .. }));
    assert_eq!(fx.chat_count("u2").await, 0);
}

#[tokio::test]
async fn test_wrong_chat_type() {
    let fx = Fixture::new();
    let u1 = fx.user("u1").await;
    fx.user("u2").await;
    let mut chat = fx
        .managers
        .chats()
        .add_direct_chat("c1", "u1", "u2", now())
        .await
        .unwrap();

    let err = chat.edit(&u1, Some("name"), now()).await.unwrap_err();
    assert!(matches!(err, ChatError::WrongChatType { operation: "edit", .. }));
    let err = chat.leave(&u1, now()).await.unwrap_err();
    assert!(matches!(err, ChatError::WrongChatType { .. }));
}

#[tokio::test]
async fn test_edit_group_name() {
    let fx = Fixture::new();
    let u1 = fx.user("u1").await;
    let mut chat = fx
        .managers
        .chats()
        .add_group_chat("g1", &u1, Some("old"), now())
        .await
        .unwrap();

    chat.edit(&u1, Some("new"), now()).await.unwrap();
    assert_eq!(chat.row.name.as_deref(), Some("new"));
    chat.edit(&u1, None, now()).await.unwrap();
    assert_eq!(chat.row.name.as_deref(), Some("new"));

    let texts = fx.message_texts("g1").await;
    assert!(texts.contains(&"@u1name changed the name of the group to \"new\"".to_string()));
}

#[tokio::test]
async fn test_delete_direct_chat_removes_everything() {
    let fx = Fixture::new();
    fx.user("u1").await;
    fx.user("u2").await;
    let chat = fx
        .managers
        .chats()
        .add_direct_chat("c1", "u1", "u2", now())
        .await
        .unwrap();
    let message = chat.add_message("m1", "u1", "hi", now()).await.unwrap();
    fx.managers
        .views()
        .record_view(&message.partition(), "u2", 1, now())
        .await
        .unwrap();

    let truncated = chat.delete_direct_chat().await.unwrap();
    assert_eq!(truncated, 1);
    assert_eq!(fx.chat_count("u1").await, 0);
    assert_eq!(fx.chat_count("u2").await, 0);
    // only the two profiles remain
    assert_eq!(fx.main.len().await, 2);
}

#[tokio::test]
async fn test_emptied_chat_deleted_by_another_leaver() {
    let fx = Fixture::new();
    let u1 = fx.user("u1").await;
    let chats = fx.managers.chats();
    let mut group = chats.add_group_chat("g1", &u1, None, now()).await.unwrap();
    let mut stale = chats.get_chat("g1").await.unwrap().unwrap();

    assert_eq!(group.leave(&u1, now()).await.unwrap(), LeaveOutcome::Deleted);
    stale.delete_emptied_group_chat().await.unwrap();

    let mut occupied = chats.add_group_chat("g2", &u1, None, now()).await.unwrap();
    let err = occupied.delete_emptied_group_chat().await.unwrap_err();
    assert!(matches!(err, ChatError::UnexpectedUserCount { expected: 0, .. }));
}

#[tokio::test]
async fn test_leave_all_chats() {
    let fx = Fixture::new();
    let u1 = fx.user("u1").await;
    let u2 = fx.user("u2").await;
    fx.user("u3").await;
    let chats = fx.managers.chats();
    chats.add_direct_chat("c1", "u1", "u2", now()).await.unwrap();
    chats.add_direct_chat("c2", "u3", "u1", now()).await.unwrap();
    let mut group = chats.add_group_chat("g1", &u2, None, now()).await.unwrap();
    group.add(&u2, &ids(&["u1"]), now()).await.unwrap();

    let summary = chats.leave_all_chats("u1", now()).await.unwrap();
    assert_eq!(
        summary,
        LeaveAllSummary {
            deleted_direct: 2,
            left_group: 1,
            skipped: 0,
        }
    );
    assert_eq!(fx.chat_count("u1").await, 0);
    group.refresh(true).await.unwrap();
    assert_eq!(group.row.user_count, 1);
    assert!(!group.is_member(&u1.user_id).await.unwrap());
}

#[tokio::test]
async fn test_leave_all_chats_skips_dangling_membership() {
    let fx = Fixture::new();
    fx.user("u1").await;
    let members = fx.managers.chats().members().clone();
    let write = ChatMemberRepository::transact_add("gone", "u1", now()).unwrap();
    fx.main.transact_write(vec![write]).await.unwrap();
    assert!(members.get("gone", "u1").await.unwrap().is_some());

    let summary = fx.managers.chats().leave_all_chats("u1", now()).await.unwrap();
    assert_eq!(summary.skipped, 1);
}

#[tokio::test]
async fn test_leave_all_chats_continues_past_unreadable_chat() {
    let fx = Fixture::new();
    fx.user("u1").await;
    fx.user("u2").await;
    let chats = fx.managers.chats();
    chats.add_direct_chat("c1", "u1", "u2", now()).await.unwrap();

    let write = ChatMemberRepository::transact_add("broken", "u1", now()).unwrap();
    fx.main.transact_write(vec![write]).await.unwrap();
    let corrupt: Item = [
        ("partitionKey".to_string(), json!("chat/broken")),
        ("sortKey".to_string(), json!("-")),
        ("chatType".to_string(), json!(42)),
    ]
    .into_iter()
    .collect();
    fx.main.put(corrupt, None).await.unwrap();

    let summary = chats.leave_all_chats("u1", now()).await.unwrap();
    assert_eq!(
        summary,
        LeaveAllSummary {
            deleted_direct: 1,
            left_group: 0,
            skipped: 1,
        }
    );
    assert!(chats.get_chat("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_record_views_counts_duplicates() {
    let fx = Fixture::new();
    fx.user("u1").await;
    fx.user("u2").await;
    fx.user("u3").await;
    let chats = fx.managers.chats();
    let chat = chats.add_direct_chat("c1", "u1", "u2", now()).await.unwrap();

    let recorded = chats
        .record_views(&ids(&["c1", "c1", "missing"]), "u1", now())
        .await
        .unwrap();
    assert_eq!(recorded, 1);
    let view = fx
        .managers
        .views()
        .get_view(&chat.view_partition(), "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.view_count, 2);
    assert_eq!(chat.get_viewed_status("u1").await.unwrap(), ViewedStatus::Viewed);

    let recorded = chats.record_views(&ids(&["c1"]), "u3", now()).await.unwrap();
    assert_eq!(recorded, 0);
    assert_eq!(chat.get_viewed_status("u3").await.unwrap(), ViewedStatus::NotViewed);
}

fn member_snapshot(unviewed: i64) -> Item {
    [("messagesUnviewedCount".to_string(), json!(unviewed))]
        .into_iter()
        .collect()
}

async fn unviewed_chats(fx: &Fixture, user_id: &str) -> i64 {
    fx.managers
        .users()
        .get_user_with(user_id, true)
        .await
        .unwrap()
        .unwrap()
        .chats_with_unviewed_messages_count
}

#[tokio::test]
async fn test_postprocess_member_transitions() {
    let fx = Fixture::new();
    fx.user("u1").await;
    let chats = fx.managers.chats();
    let (zero, one, two) = (member_snapshot(0), member_snapshot(1), member_snapshot(2));

    chats
        .postprocess_record("chat/c1", "member/u1", Some(&zero), Some(&one))
        .await
        .unwrap();
    assert_eq!(unviewed_chats(&fx, "u1").await, 1);

    chats
        .postprocess_record("chat/c1", "member/u1", Some(&one), Some(&two))
        .await
        .unwrap();
    chats
        .postprocess_record("chat/c1", "member/u1", Some(&two), Some(&two))
        .await
        .unwrap();
    assert_eq!(unviewed_chats(&fx, "u1").await, 1);

    chats
        .postprocess_record("chat/c1", "member/u1", Some(&two), Some(&zero))
        .await
        .unwrap();
    assert_eq!(unviewed_chats(&fx, "u1").await, 0);

    // fail-soft floor
    chats
        .postprocess_record("chat/c1", "member/u1", Some(&one), None)
        .await
        .unwrap();
    assert_eq!(unviewed_chats(&fx, "u1").await, 0);
}

#[tokio::test]
async fn test_postprocess_message_added_and_chat_view() {
    let fx = Fixture::new();
    fx.user("u1").await;
    fx.user("u2").await;
    let chats = fx.managers.chats();
    chats.add_direct_chat("c1", "u1", "u2", now()).await.unwrap();
    let at = now() + Duration::minutes(5);

    chats
        .postprocess_chat_message_added("c1", Some("u1"), at)
        .await
        .unwrap();
    let chat = chats.get_chat_with("c1", true).await.unwrap().unwrap();
    assert_eq!(chat.row.messages_count, 1);
    assert_eq!(chat.row.last_message_activity_at, Some(at));
    let author = chats.members().get("c1", "u1").await.unwrap().unwrap();
    let other = chats.members().get("c1", "u2").await.unwrap().unwrap();
    assert_eq!(author.messages_unviewed_count, 0);
    assert_eq!(author.last_message_activity_at, Some(at));
    assert_eq!(other.messages_unviewed_count, 1);
    let card = CardSpec::chat_activity("u2");
    assert!(fx.managers.cards().get_card(&card).await.unwrap().is_some());

    // an older message does not move activity backwards
    chats
        .postprocess_chat_message_added("c1", None, now())
        .await
        .unwrap();
    let chat = chats.get_chat_with("c1", true).await.unwrap().unwrap();
    assert_eq!(chat.row.last_message_activity_at, Some(at));

    let view: Item = [("viewCount".to_string(), json!(1))].into_iter().collect();
    chats
        .postprocess_record("chat/c1", "view/u2", None, Some(&view))
        .await
        .unwrap();
    let other = chats.members().get("c1", "u2").await.unwrap().unwrap();
    assert_eq!(other.messages_unviewed_count, 0);
    assert!(fx.managers.cards().get_card(&card).await.unwrap().is_none());
}

#[tokio::test]
async fn test_postprocess_message_deleted() {
    let fx = Fixture::new();
    fx.user("u1").await;
    fx.user("u2").await;
    let chats = fx.managers.chats();
    chats.add_direct_chat("c1", "u1", "u2", now()).await.unwrap();
    for _ in 0..2 {
        chats
            .postprocess_chat_message_added("c1", Some("u1"), now())
            .await
            .unwrap();
    }
    let views = fx.managers.views();
    let viewed = crate::models::chat_message::ChatMessageRepository::key("m1").partition;
    views.record_view(&viewed, "u2", 1, now()).await.unwrap();

    chats
        .postprocess_chat_message_deleted("c1", "m1", Some("u1"), now())
        .await
        .unwrap();
    assert!(views.get_view(&viewed, "u2").await.unwrap().is_none());
    let other = chats.members().get("c1", "u2").await.unwrap().unwrap();
    assert_eq!(other.messages_unviewed_count, 2);

    chats
        .postprocess_chat_message_deleted("c1", "m2", Some("u1"), now())
        .await
        .unwrap();
    let other = chats.members().get("c1", "u2").await.unwrap().unwrap();
    assert_eq!(other.messages_unviewed_count, 1);
    let chat = chats.get_chat_with("c1", true).await.unwrap().unwrap();
    assert_eq!(chat.row.messages_count, 0);
    assert!(fx
        .main
        .get(&Key::new("chat/c1", "member/u2"), true)
        .await
        .unwrap()
        .is_some());
}
