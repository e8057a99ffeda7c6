use agentloop::memory::{
    InMemoryStore, MemoryRouter, MemoryStore, MessageMetadata, RetentionPolicy,
};
use std::io::{Read, Write};
use std::sync::Arc;

#[tokio::test]
async fn snapshot_survives_a_file_round_trip() {
    let store = Arc::new(InMemoryStore::new());

    store
        .store_message("s1", "user", "what is 2 + 2", MessageMetadata::for_agent("math"))
        .await
        .unwrap();
    store
        .store_message("s1", "assistant", "4", MessageMetadata::for_agent("math"))
        .await
        .unwrap();
    let original = store.get_messages("s1", None).await.unwrap();

    // Save to a file, clear, load back.
    let snapshot = store.snapshot("s1").await.unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(snapshot.as_bytes()).unwrap();

    store.clear_memory(Some("s1"), None).await.unwrap();
    assert!(store.get_messages("s1", None).await.unwrap().is_empty());

    let mut reloaded = String::new();
    std::fs::File::open(file.path())
        .unwrap()
        .read_to_string(&mut reloaded)
        .unwrap();
    store.restore("s1", &reloaded).await.unwrap();

    let restored = store.get_messages("s1", None).await.unwrap();
    assert_eq!(original, restored);
}

#[tokio::test]
async fn router_delegates_and_swaps_backends() {
    let first = Arc::new(InMemoryStore::new());
    let router = MemoryRouter::new(first.clone());

    router
        .store_message("s", "user", "on the first backend", MessageMetadata::default())
        .await
        .unwrap();
    assert_eq!(router.get_messages("s", None).await.unwrap().len(), 1);

    // Swap in a fresh backend; reads now hit the replacement.
    let second = Arc::new(InMemoryStore::new());
    router.set_backend(second.clone()).await;
    assert!(router.get_messages("s", None).await.unwrap().is_empty());

    router
        .store_message("s", "user", "on the second backend", MessageMetadata::default())
        .await
        .unwrap();
    assert_eq!(second.get_messages("s", None).await.unwrap().len(), 1);
    // The old backend kept its data.
    assert_eq!(first.get_messages("s", None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn retention_applies_to_reads_without_discarding_writes() {
    let store = InMemoryStore::new();
    for i in 0..10 {
        store
            .store_message("s", "user", &format!("message {}", i), MessageMetadata::default())
            .await
            .unwrap();
    }

    store
        .set_retention_policy(RetentionPolicy::SlidingWindow(3))
        .await;
    let windowed = store.get_messages("s", None).await.unwrap();
    assert_eq!(windowed.len(), 3);
    assert_eq!(windowed[0].content, "message 7");

    // Loosening the policy reveals the full stored sequence again.
    store.set_retention_policy(RetentionPolicy::Unbounded).await;
    assert_eq!(store.get_messages("s", None).await.unwrap().len(), 10);
}

#[tokio::test]
async fn memory_router_connects_the_in_memory_tag() {
    let router = MemoryRouter::connect("in_memory").await.unwrap();
    router
        .store_message("s", "user", "hello", MessageMetadata::default())
        .await
        .unwrap();
    assert_eq!(router.get_messages("s", None).await.unwrap().len(), 1);
}
