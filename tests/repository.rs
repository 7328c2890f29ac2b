//! Repository lifecycle: spec stability, exclusive locking, destroy.

use depot::{CancellationToken, Repository};
use std::time::Duration;

#[tokio::test]
async fn reopen_keeps_the_spec_and_the_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repo");
    let cancel = CancellationToken::new();

    let repo = Repository::open(&path).await.unwrap();
    let cid = repo
        .block_store()
        .put(bytes::Bytes::from_static(b"durable"))
        .await
        .unwrap();
    let spec_before = std::fs::read(path.join("datastore_spec")).unwrap();
    repo.close().await.unwrap();

    let repo = Repository::open(&path).await.unwrap();
    let spec_after = std::fs::read(path.join("datastore_spec")).unwrap();
    assert_eq!(spec_before, spec_after);

    let block = repo.block_store().get(&cid, &cancel).await.unwrap();
    assert_eq!(block.data.as_ref(), b"durable");

    repo.close().await.unwrap();
}

#[tokio::test]
async fn second_open_blocks_until_release() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repo");

    let first = Repository::open(&path).await.unwrap();

    let contender = tokio::spawn({
        let path = path.clone();
        async move { Repository::open(&path).await }
    });

    // the second open must not complete while the lock is held
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!contender.is_finished(), "second open must block");

    first.close().await.unwrap();

    // and must complete promptly once the holder releases
    let second = tokio::time::timeout(Duration::from_secs(2), contender)
        .await
        .expect("blocked open must finish within the bound")
        .unwrap()
        .unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn destroy_is_idempotent_and_allows_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repo");

    let repo = Repository::open(&path).await.unwrap();
    repo.block_store()
        .put(bytes::Bytes::from_static(b"gone soon"))
        .await
        .unwrap();

    repo.destroy().await.unwrap();
    assert!(!path.exists());
    repo.destroy().await.unwrap();

    // the path can host a brand new repository afterwards
    let fresh = Repository::open(&path).await.unwrap();
    assert!(fresh.disk_usage().await.unwrap() > 0);
    fresh.close().await.unwrap();
}
