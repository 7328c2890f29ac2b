//! Import ∘ extract round-trips over real repositories on disk.

use depot::{CancellationToken, Error, Extractor, Importer, Repository};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

async fn open_repo(dir: &Path) -> Repository {
    let _ = tracing_subscriber::fmt::try_init();
    Repository::open(dir.join("repo")).await.unwrap()
}

fn write_file(path: &Path, content: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

#[tokio::test]
async fn tree_roundtrip_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    let source = dir.path().join("tree");
    write_file(&source.join("a.txt"), b"alpha");
    write_file(&source.join("empty"), b"");
    write_file(&source.join("big.bin"), &patterned(2 * 1024 * 1024 + 777));
    write_file(&source.join("sub").join("nested.txt"), b"down under");
    write_file(&source.join("sub").join("deeper").join("leaf"), b"leaf");

    let result = Importer::new(repo.block_store(), &source)
        .import(&cancel)
        .await
        .unwrap();

    assert_eq!(result.file_name, "tree");
    assert_eq!(
        result.total_size,
        result.contents.iter().map(|c| c.size).sum::<u64>()
    );
    assert_eq!(result.contents.len(), 5);

    // every block referenced from a package is present in the store
    let all_cids = result
        .packages
        .iter()
        .flat_map(|p| p.cids.iter().cloned())
        .collect::<Vec<_>>();
    assert!(!all_cids.is_empty());
    assert!(repo
        .block_store()
        .has_all(&all_cids, &cancel)
        .await
        .unwrap());

    let out = dir.path().join("out");
    Extractor::new(repo.block_store(), result.root_cid.clone(), &out)
        .extract(&cancel, false)
        .await
        .unwrap();

    let restored = out.join("tree");
    assert_eq!(std::fs::read(restored.join("a.txt")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(restored.join("empty")).unwrap(), b"");
    assert_eq!(
        std::fs::read(restored.join("big.bin")).unwrap(),
        patterned(2 * 1024 * 1024 + 777)
    );
    assert_eq!(
        std::fs::read(restored.join("sub").join("nested.txt")).unwrap(),
        b"down under"
    );
    assert_eq!(
        std::fs::read(restored.join("sub").join("deeper").join("leaf")).unwrap(),
        b"leaf"
    );

    repo.close().await.unwrap();
}

#[tokio::test]
async fn stream_content_reads_a_file_without_extraction() {
    use futures::TryStreamExt;

    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    let content = patterned(1024 * 1024 + 321);
    let source = dir.path().join("streamed.bin");
    std::fs::write(&source, &content).unwrap();

    let result = Importer::new(repo.block_store(), &source)
        .import(&cancel)
        .await
        .unwrap();

    // resolve the file's identifier through the wrapping directories
    let mut file_cid = result.root_cid.clone();
    for _ in 0..2 {
        let block = repo.block_store().get(&file_cid, &cancel).await.unwrap();
        let links = depot_unixfs::block_links(&block.data).unwrap();
        assert_eq!(links.len(), 1);
        file_cid = links[0].clone();
    }

    let chunks: Vec<bytes::Bytes> =
        depot::stream_content(repo.block_store(), file_cid, cancel.clone())
            .try_collect()
            .await
            .unwrap();
    let combined = chunks.concat();
    assert_eq!(combined, content);

    repo.close().await.unwrap();
}

#[tokio::test]
async fn identical_trees_share_a_root() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    for name in &["first", "second"] {
        let source = dir.path().join(name).join("same");
        write_file(&source.join("data.bin"), &patterned(1024));
    }

    let first = Importer::new(repo.block_store(), dir.path().join("first").join("same"))
        .import(&cancel)
        .await
        .unwrap();
    let second = Importer::new(repo.block_store(), dir.path().join("second").join("same"))
        .import(&cancel)
        .await
        .unwrap();

    assert_eq!(first.root_cid, second.root_cid);
    assert_eq!(first.packages, second.packages);

    repo.close().await.unwrap();
}

#[tokio::test]
async fn empty_file_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    let source = dir.path().join("x");
    std::fs::write(&source, b"").unwrap();

    let result = Importer::new(repo.block_store(), &source)
        .import(&cancel)
        .await
        .unwrap();

    assert_eq!(result.total_size, 0);
    assert!(!result.root_cid.to_string().is_empty());
    assert_eq!(result.contents.len(), 1);
    assert_eq!(result.contents[0].name, "x");
    assert_eq!(result.contents[0].size, 0);

    let flattened = result
        .packages
        .iter()
        .flat_map(|p| p.cids.iter())
        .collect::<Vec<_>>();
    assert!(flattened.contains(&&result.root_cid));

    let out = dir.path().join("out");
    Extractor::new(repo.block_store(), result.root_cid.clone(), &out)
        .extract(&cancel, false)
        .await
        .unwrap();

    // single files are presented in the uniform two-level shape
    let restored = out.join("folder").join("x");
    assert_eq!(std::fs::metadata(&restored).unwrap().len(), 0);

    repo.close().await.unwrap();
}

#[tokio::test]
async fn chunk_boundary_file() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    let source = dir.path().join("exact.bin");
    let content = patterned(3 * 1024 * 1024);
    std::fs::write(&source, &content).unwrap();

    let result = Importer::new(repo.block_store(), &source)
        .import(&cancel)
        .await
        .unwrap();

    // the pattern repeats per chunk so the three leaves deduplicate into one identifier; the
    // distinct set is leaf + file node + the two wrapping directories
    let distinct = result
        .packages
        .iter()
        .flat_map(|p| p.cids.iter())
        .collect::<std::collections::HashSet<_>>();
    assert!(distinct.len() >= 4, "got {} distinct blocks", distinct.len());

    let out = dir.path().join("out");
    Extractor::new(repo.block_store(), result.root_cid.clone(), &out)
        .extract(&cancel, false)
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(out.join("folder").join("exact.bin")).unwrap(),
        content
    );

    repo.close().await.unwrap();
}

#[tokio::test]
async fn overwrite_same_size_skips_the_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    let source = dir.path().join("src");
    write_file(&source.join("steady.bin"), &patterned(8 * 1024));

    let result = Importer::new(repo.block_store(), &source)
        .import(&cancel)
        .await
        .unwrap();

    let out = dir.path().join("out");
    Extractor::new(repo.block_store(), result.root_cid.clone(), &out)
        .extract(&cancel, true)
        .await
        .unwrap();

    let target = out.join("src").join("steady.bin");
    let first_mtime = std::fs::metadata(&target).unwrap().modified().unwrap();

    let reported = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&reported);
    Extractor::new(repo.block_store(), result.root_cid.clone(), &out)
        .with_progress(move |extracted| sink.store(extracted, Ordering::Relaxed))
        .extract(&cancel, true)
        .await
        .unwrap();

    let second_mtime = std::fs::metadata(&target).unwrap().modified().unwrap();
    assert_eq!(first_mtime, second_mtime, "the file must not be rewritten");
    assert_eq!(
        reported.load(Ordering::Relaxed),
        8 * 1024,
        "skipped writes still count as progress"
    );

    repo.close().await.unwrap();
}

#[tokio::test]
async fn backslash_names_nest_and_traversal_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    // nested placement
    let source = dir.path().join("nested");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("docs\\readme.md"), b"hello").unwrap();

    let result = Importer::new(repo.block_store(), &source)
        .import(&cancel)
        .await
        .unwrap();

    let out = dir.path().join("out");
    Extractor::new(repo.block_store(), result.root_cid.clone(), &out)
        .extract(&cancel, false)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(out.join("nested").join("docs").join("readme.md")).unwrap(),
        b"hello"
    );

    // traversal attempt
    let evil = dir.path().join("evil");
    std::fs::create_dir_all(&evil).unwrap();
    std::fs::write(evil.join("a\\..\\escape"), b"nope").unwrap();

    match Importer::new(repo.block_store(), &evil).import(&cancel).await {
        Err(Error::PathTraversalAttempt { name }) => assert_eq!(name, "a\\..\\escape"),
        x => panic!("unexpected: {:?}", x.map(|_| ())),
    }

    // empty component
    let broken = dir.path().join("broken");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("a\\???\\b"), b"nope").unwrap();

    match Importer::new(repo.block_store(), &broken).import(&cancel).await {
        Err(Error::InvalidPathComponent { .. }) => {}
        x => panic!("unexpected: {:?}", x.map(|_| ())),
    }

    repo.close().await.unwrap();
}

#[tokio::test]
async fn duplicate_cleaned_names_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    let source = dir.path().join("dups");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("a?.txt"), b"one").unwrap();
    std::fs::write(source.join("a*.txt"), b"two").unwrap();

    match Importer::new(repo.block_store(), &source).import(&cancel).await {
        Err(Error::DuplicateEntry { first, second }) => {
            let mut originals = vec![first, second];
            originals.sort();
            assert_eq!(originals, vec!["a*.txt".to_string(), "a?.txt".to_string()]);
        }
        x => panic!("unexpected: {:?}", x.map(|_| ())),
    }

    repo.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn symlinks_roundtrip_and_absolute_targets_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    // a relative symlink survives the roundtrip
    let source = dir.path().join("linked");
    write_file(&source.join("file.txt"), b"pointed at");
    std::os::unix::fs::symlink("file.txt", source.join("link")).unwrap();

    let result = Importer::new(repo.block_store(), &source)
        .import(&cancel)
        .await
        .unwrap();

    let out = dir.path().join("out");
    Extractor::new(repo.block_store(), result.root_cid.clone(), &out)
        .extract(&cancel, false)
        .await
        .unwrap();

    let link = out.join("linked").join("link");
    assert_eq!(
        std::fs::read_link(&link).unwrap(),
        std::path::PathBuf::from("file.txt")
    );
    assert_eq!(std::fs::read(&link).unwrap(), b"pointed at");

    // an absolute target must not be materialized
    let evil = dir.path().join("evil");
    std::fs::create_dir_all(&evil).unwrap();
    std::os::unix::fs::symlink("/etc/passwd", evil.join("sneaky")).unwrap();

    let result = Importer::new(repo.block_store(), &evil)
        .import(&cancel)
        .await
        .unwrap();

    let out2 = dir.path().join("out2");
    match Extractor::new(repo.block_store(), result.root_cid.clone(), &out2)
        .extract(&cancel, false)
        .await
    {
        Err(Error::InvalidSymlinkTarget { target }) => assert_eq!(target, "/etc/passwd"),
        x => panic!("unexpected: {:?}", x),
    }
    assert!(
        std::fs::symlink_metadata(out2.join("evil").join("sneaky")).is_err(),
        "no symlink may be created"
    );

    repo.close().await.unwrap();
}

#[tokio::test]
async fn import_progress_is_monotone_and_complete() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    let source = dir.path().join("progress");
    write_file(&source.join("a.bin"), &patterned(700 * 1024));
    write_file(&source.join("b.bin"), &patterned(900 * 1024));

    let last = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&last);

    let result = Importer::new(repo.block_store(), &source)
        .with_progress(move |processed, total, _file| {
            assert_eq!(total, (700 + 900) * 1024);
            let previous = sink.swap(processed, Ordering::Relaxed);
            assert!(processed >= previous, "progress went backwards");
        })
        .import(&cancel)
        .await
        .unwrap();

    assert_eq!(last.load(Ordering::Relaxed), result.total_size);
    repo.close().await.unwrap();
}

#[tokio::test]
async fn cancellation_stops_the_import() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;

    let source = dir.path().join("cancelled");
    write_file(&source.join("file"), b"data");

    let cancel = CancellationToken::new();
    cancel.cancel();

    match Importer::new(repo.block_store(), &source).import(&cancel).await {
        Err(Error::Cancelled) => {}
        x => panic!("unexpected: {:?}", x.map(|_| ())),
    }

    repo.close().await.unwrap();
}

#[tokio::test]
async fn extraction_does_not_escape_the_base() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path()).await;
    let cancel = CancellationToken::new();

    let source = dir.path().join("safe");
    write_file(&source.join("inner.txt"), b"stay put");

    let result = Importer::new(repo.block_store(), &source)
        .import(&cancel)
        .await
        .unwrap();

    let out = dir.path().join("deep").join("out");
    Extractor::new(repo.block_store(), result.root_cid.clone(), &out)
        .extract(&cancel, false)
        .await
        .unwrap();

    // nothing may appear outside of the destination
    let outside = std::fs::read_dir(dir.path().join("deep"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert_eq!(outside, vec!["out".to_string()]);

    repo.close().await.unwrap();
}
