//! Integration tests for source and work item persistence.

use chrono::Utc;
use tributary_db::test_fixtures::TestDatabase;
use tributary_db::{
    EmbeddedChunk, FetchStatus, ImageCaption, IncomingItem, ItemRepository, RepoRef,
    SourceRepository, SourceStatus, SourceUpdate, Stage, TriState, Vector,
};

fn incoming(id: &str) -> IncomingItem {
    IncomingItem {
        external_id: id.to_string(),
        title: Some(format!("Post {id}")),
        url: Some(format!("https://blog.example/{id}")),
        content: "See https://github.com/tokio-rs/tokio for details".to_string(),
        published_at: Some(Utc::now()),
    }
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_insert_new_items_is_idempotent_per_source() {
    let mut test_db = TestDatabase::new().await;
    let source_id = test_db.source("https://blog.example/feed.json").await;
    let items = &test_db.db.items;

    let first = items
        .insert_new_items(source_id, &[incoming("a"), incoming("b")])
        .await
        .unwrap();
    let second = items
        .insert_new_items(source_id, &[incoming("b"), incoming("c")])
        .await
        .unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);

    let item = items.get(second[0]).await.unwrap().unwrap();
    assert_eq!(item.external_id, "c");
    assert_eq!(item.stage(Stage::Images).status, TriState::Unset);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_stage_flags_and_stalled_lookup() {
    let mut test_db = TestDatabase::new().await;
    let source_id = test_db.source("https://blog.example/feed.json").await;
    let items = &test_db.db.items;

    let ids = items
        .insert_new_items(source_id, &[incoming("x")])
        .await
        .unwrap();
    let id = ids[0];

    items
        .record_stage(id, Stage::Images, TriState::Success, None)
        .await
        .unwrap();
    // Just became ready: left to its queued task until the grace passes.
    let grace = Utc::now() - chrono::Duration::minutes(10);
    let stalled = items
        .find_stalled(Stage::Rag, grace, Utc::now(), 3, 1000)
        .await
        .unwrap();
    assert!(!stalled.contains(&id));

    let later = Utc::now() + chrono::Duration::minutes(1);
    let stalled = items
        .find_stalled(Stage::Rag, later, Utc::now(), 3, 1000)
        .await
        .unwrap();
    assert!(stalled.contains(&id));

    items
        .record_stage(id, Stage::Rag, TriState::Failed, Some("embedder down"))
        .await
        .unwrap();
    let item = items.get(id).await.unwrap().unwrap();
    let rag = item.stage(Stage::Rag);
    assert_eq!(rag.status, TriState::Failed);
    assert_eq!(rag.attempts, 1);
    assert_eq!(rag.error.as_deref(), Some("embedder down"));

    // Still cooling down
    let cutoff = Utc::now() - chrono::Duration::minutes(30);
    let stalled = items
        .find_stalled(Stage::Rag, later, cutoff, 3, 1000)
        .await
        .unwrap();
    assert!(!stalled.contains(&id));

    items.reset_stage(id, Stage::Rag).await.unwrap();
    let item = items.get(id).await.unwrap().unwrap();
    assert_eq!(item.stage(Stage::Rag).attempts, 0);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_chunks_captions_and_repository_links() {
    let mut test_db = TestDatabase::new().await;
    let source_id = test_db.source("https://blog.example/feed.json").await;
    let items = &test_db.db.items;
    let id = items
        .insert_new_items(source_id, &[incoming("y")])
        .await
        .unwrap()[0];

    items
        .store_image_captions(
            id,
            &[ImageCaption {
                url: "https://blog.example/a.png".into(),
                caption: "a diagram".into(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(items.image_captions(id).await.unwrap().len(), 1);

    let dim = 768;
    items
        .replace_chunks(
            id,
            vec![EmbeddedChunk {
                index: 0,
                text: "chunk".into(),
                embedding: Vector::from(vec![0.1; dim]),
            }],
        )
        .await
        .unwrap();

    let repo = RepoRef::new("tokio-rs", format!("tokio-{}", uuid::Uuid::new_v4()));
    let created = items
        .link_repositories(id, &[repo.clone(), repo.clone()])
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let again = items.link_repositories(id, &[repo]).await.unwrap();
    assert!(again.is_empty());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_record_attempt_and_due_sources() {
    let mut test_db = TestDatabase::new().await;
    let source_id = test_db.source("https://blog.example/feed.json").await;
    let sources = &test_db.db.sources;

    let due = sources.due(Utc::now(), 10_000).await.unwrap();
    assert!(due.iter().any(|s| s.id == source_id));

    sources
        .record_attempt(
            source_id,
            &SourceUpdate {
                status: SourceStatus::Active,
                error_count: 0,
                last_fetch_status: FetchStatus::Success,
                last_fetch_error: None,
                last_fetched_at: Utc::now(),
                next_fetch_at: Some(Utc::now() + chrono::Duration::hours(1)),
                validators: None,
            },
        )
        .await
        .unwrap();

    let due = sources.due(Utc::now(), 10_000).await.unwrap();
    assert!(!due.iter().any(|s| s.id == source_id));

    sources
        .set_status(source_id, SourceStatus::Disabled)
        .await
        .unwrap();
    let stored = sources.get(source_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SourceStatus::Disabled);

    test_db.cleanup().await;
}
