//! File-backed local store, including survival of offline writes across
//! restarts.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use classroom_sync::{
    ClassroomSync, FileStore, LocalStore, MemoryRemote, PersistedCollection, RemoteError,
    Subject, SyncState,
};

async fn open_store(dir: &TempDir) -> Arc<FileStore> {
    Arc::new(FileStore::open(dir.path()).await.unwrap())
}

#[tokio::test]
async fn test_crud_and_prefix_listing() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    assert!(store.get("classroom:class-a:subjects").await.unwrap().is_none());

    store
        .set("classroom:class-a:subjects", json!({ "items": [] }))
        .await
        .unwrap();
    store
        .set("classroom:class-a:assignments", json!({ "items": [1] }))
        .await
        .unwrap();
    store
        .set("classroom:class-b:subjects", json!({ "items": [2] }))
        .await
        .unwrap();

    assert_eq!(
        store.get("classroom:class-a:assignments").await.unwrap(),
        Some(json!({ "items": [1] }))
    );
    assert_eq!(
        store.keys("classroom:class-a:").await.unwrap(),
        vec![
            "classroom:class-a:assignments".to_string(),
            "classroom:class-a:subjects".to_string(),
        ]
    );

    store.remove("classroom:class-a:subjects").await.unwrap();
    // Removing a missing key is fine.
    store.remove("classroom:class-a:subjects").await.unwrap();
    assert_eq!(store.keys("classroom:").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_keys_with_unusual_characters() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let key = "school:room 4/b:subjects";
    store.set(key, json!({ "ok": true })).await.unwrap();
    assert_eq!(store.keys("school:").await.unwrap(), vec![key.to_string()]);
    assert_eq!(store.get(key).await.unwrap(), Some(json!({ "ok": true })));
}

#[tokio::test]
async fn test_offline_create_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_with(RemoteError::Unavailable("offline".into()));
        let sync = ClassroomSync::builder(remote, open_store(&dir).await).build();
        sync.set_active_class("class-a");
        let subjects = sync.collection::<Subject>();
        subjects.ensure_loaded().await.unwrap();

        let outcome = subjects.add(&Subject::named("History")).await.unwrap();
        assert!(!outcome.synced);
        sync.shutdown().await.unwrap();
    }

    let store = open_store(&dir).await;
    let raw = store.get("classroom:class-a:subjects").await.unwrap().unwrap();
    let persisted: PersistedCollection = serde_json::from_value(raw).unwrap();
    assert_eq!(persisted.version, 1);
    assert_eq!(persisted.local_only_count(), 1);

    // Still offline after restart: the draft is served from disk.
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_with(RemoteError::Timeout);
    let sync = ClassroomSync::builder(remote.clone(), store).build();
    sync.set_active_class("class-a");
    let subjects = sync.collection::<Subject>();
    subjects.ensure_loaded().await.unwrap();

    let items = subjects.items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].data.name, "History");
    assert_eq!(subjects.sync_state(), Some(SyncState::Stale));

    // Back online: the draft is pushed once.
    remote.recover();
    subjects.refresh().await.unwrap();
    assert!(subjects.synced_with_cloud());
    assert_eq!(remote.create_calls(), 1);
    sync.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_document_reads_as_empty() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("classroom%3Aclass-a%3Asubjects.json"),
        br#"{"version":1,"ite"#,
    )
    .unwrap();

    let remote = Arc::new(MemoryRemote::new());
    let sync = ClassroomSync::builder(remote.clone(), open_store(&dir).await).build();
    sync.set_active_class("class-a");
    let subjects = sync.collection::<Subject>();

    subjects.ensure_loaded().await.unwrap();
    assert!(subjects.items().is_empty());
    assert!(subjects.synced_with_cloud());

    // Offline writes replace the corrupt document instead of failing.
    remote.fail_with(RemoteError::Unavailable("offline".into()));
    let outcome = subjects.add(&Subject::named("History")).await.unwrap();
    assert!(!outcome.synced);
    sync.flush().await.unwrap();

    let store = open_store(&dir).await;
    let raw = store.get("classroom:class-a:subjects").await.unwrap().unwrap();
    let persisted: PersistedCollection = serde_json::from_value(raw).unwrap();
    assert_eq!(persisted.local_only_count(), 1);
    sync.shutdown().await.unwrap();
}
