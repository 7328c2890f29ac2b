//! Block-level behavior over the real on-disk datastore stack.

use depot::{BlockStore, CancellationToken, Error, Repository};
use bytes::Bytes;
use std::time::{Duration, Instant};

async fn store(dir: &std::path::Path) -> (Repository, BlockStore) {
    let repo = Repository::open(dir.join("repo")).await.unwrap();
    let store = repo.block_store();
    (repo, store)
}

#[tokio::test]
async fn get_returns_what_put_stored() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, store) = store(dir.path()).await;
    let cancel = CancellationToken::new();

    let payload = Bytes::from((0u8..=255).collect::<Vec<_>>());
    let cid = store.put(payload.clone()).await.unwrap();

    let block = store.get(&cid, &cancel).await.unwrap();
    assert_eq!(block.data, payload);

    // identical bytes land on the identical identifier across stores
    assert_eq!(cid, BlockStore::cid_for(&payload).unwrap());

    repo.close().await.unwrap();
}

#[tokio::test]
async fn absent_block_takes_the_full_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, store) = store(dir.path()).await;
    let cancel = CancellationToken::new();

    let absent = BlockStore::cid_for(b"never stored").unwrap();

    let started = Instant::now();
    match store.get(&absent, &cancel).await {
        Err(Error::BlockNotFound { cid }) => assert_eq!(cid, absent),
        x => panic!("unexpected: {:?}", x.map(|_| ())),
    }
    let elapsed = started.elapsed();

    // 50 + 100 + 200 ms of exponential backoff
    assert!(elapsed >= Duration::from_millis(340), "too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(900), "too slow: {:?}", elapsed);

    repo.close().await.unwrap();
}

#[tokio::test]
async fn has_all_handles_large_sets() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, store) = store(dir.path()).await;
    let cancel = CancellationToken::new();

    // more identifiers than the lookup concurrency bound
    let payloads = (0u32..250)
        .map(|i| Bytes::from(i.to_be_bytes().to_vec()))
        .collect::<Vec<_>>();
    let cids = store.put_many(payloads, &cancel).await.unwrap();

    assert!(store.has_all(&cids, &cancel).await.unwrap());
    assert!(store.has_all(&[], &cancel).await.unwrap());

    let mut one_missing = cids;
    one_missing.push(BlockStore::cid_for(b"missing").unwrap());
    assert!(!store.has_all(&one_missing, &cancel).await.unwrap());

    repo.close().await.unwrap();
}

#[tokio::test]
async fn put_with_cid_stores_under_the_given_identifier() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, store) = store(dir.path()).await;
    let cancel = CancellationToken::new();

    let cid = depot_unixfs::raw_cid(b"raw leaf");
    store
        .put_with_cid(&cid, Bytes::from_static(b"raw leaf"))
        .await
        .unwrap();

    let block = store.get(&cid, &cancel).await.unwrap();
    assert_eq!(block.data.as_ref(), b"raw leaf");

    repo.close().await.unwrap();
}

#[tokio::test]
async fn cancelled_has_all_reports_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, store) = store(dir.path()).await;

    let cids = (0u32..50)
        .map(|i| BlockStore::cid_for(&i.to_be_bytes()).unwrap())
        .collect::<Vec<_>>();

    let cancel = CancellationToken::new();
    cancel.cancel();

    match store.has_all(&cids, &cancel).await {
        Err(Error::Cancelled) => {}
        x => panic!("unexpected: {:?}", x),
    }

    repo.close().await.unwrap();
}
