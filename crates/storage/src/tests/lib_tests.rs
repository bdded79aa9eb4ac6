use super::*;
use chrono::Duration;

fn pending_at(id: &str, conversation: i64, text: &str, at: DateTime<Utc>) -> PendingMessage {
    PendingMessage {
        id: id.to_string(),
        conversation_id: ConversationId(conversation),
        message_text: text.to_string(),
        created_at: at,
        status: PendingStatus::Pending,
        parent_message_id: None,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_with_wal_journal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("outbox.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    assert_eq!(storage.journal_mode().await.expect("journal mode"), "wal");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn lists_pending_messages_oldest_first() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let now = Utc::now();

    storage
        .insert_pending_message(&pending_at("late", 1, "third", now + Duration::seconds(2)))
        .await
        .expect("insert");
    storage
        .insert_pending_message(&pending_at("early", 1, "first", now))
        .await
        .expect("insert");
    storage
        .insert_pending_message(&pending_at("middle", 2, "second", now + Duration::seconds(1)))
        .await
        .expect("insert");

    let ids: Vec<String> = storage
        .list_pending_messages()
        .await
        .expect("list")
        .into_iter()
        .map(|message| message.id)
        .collect();
    assert_eq!(ids, vec!["early", "middle", "late"]);
}

#[tokio::test]
async fn equal_timestamps_keep_insertion_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let now = Utc::now();
    for id in ["b", "a", "c"] {
        storage
            .insert_pending_message(&pending_at(id, 1, id, now))
            .await
            .expect("insert");
    }

    let ids: Vec<String> = storage
        .list_pending_messages()
        .await
        .expect("list")
        .into_iter()
        .map(|message| message.id)
        .collect();
    assert_eq!(ids, vec!["b", "a", "c"]);
}

#[tokio::test]
async fn duplicate_client_id_is_rejected() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let message = pending_at("c1", 5, "hi", Utc::now());
    storage
        .insert_pending_message(&message)
        .await
        .expect("first insert");

    let err = storage
        .insert_pending_message(&message)
        .await
        .expect_err("primary key must reject duplicates");
    assert!(err.to_string().contains("c1"));
    assert_eq!(storage.count_pending_messages().await.expect("count"), 1);
}

#[tokio::test]
async fn round_trips_all_columns() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut message = pending_at("reply", 9, "re: hello", Utc::now());
    message.parent_message_id = Some(MessageId(77));
    storage
        .insert_pending_message(&message)
        .await
        .expect("insert");

    let loaded = storage
        .load_pending_message("reply")
        .await
        .expect("load")
        .expect("row present");
    assert_eq!(loaded.conversation_id, ConversationId(9));
    assert_eq!(loaded.message_text, "re: hello");
    assert_eq!(loaded.parent_message_id, Some(MessageId(77)));
    assert_eq!(loaded.status, PendingStatus::Pending);
    assert_eq!(
        loaded.created_at.timestamp_micros(),
        message.created_at.timestamp_micros()
    );
}

#[tokio::test]
async fn marks_failed_and_deletes() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .insert_pending_message(&pending_at("c1", 5, "hi", Utc::now()))
        .await
        .expect("insert");

    assert!(storage
        .mark_pending_message_failed("c1")
        .await
        .expect("mark failed"));
    let loaded = storage
        .load_pending_message("c1")
        .await
        .expect("load")
        .expect("row present");
    assert_eq!(loaded.status, PendingStatus::Failed);

    assert!(storage.delete_pending_message("c1").await.expect("delete"));
    assert!(!storage.delete_pending_message("c1").await.expect("delete"));
    assert!(!storage
        .mark_pending_message_failed("c1")
        .await
        .expect("mark missing"));
    assert_eq!(storage.count_pending_messages().await.expect("count"), 0);
}

#[test]
fn memory_urls_have_no_file_path() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(
        sqlite_path("sqlite://./data/outbox.db?mode=rwc"),
        Some(PathBuf::from("./data/outbox.db"))
    );
}
