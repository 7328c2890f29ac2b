//! Extracting stored trees back onto the filesystem.
//!
//! Every target path is proven to stay inside the output base and to have no symlinked ancestor
//! before anything is written. Files materialize through an exclusive `.part` sibling which is
//! fsynced and renamed over the final name, so a crash never leaves a half-written target.

use crate::path::{
    absolutize, ensure_no_symlink_in_path, has_invalid_filename_chars, is_subpath,
    validate_symlink_target,
};
use crate::repo::{Block, BlockStore};
use crate::{Error, Result};
use bytes::Bytes;
use cid::Cid;
use depot_unixfs::dir::{directory_entries, symlink_target, DirectoryEntry};
use depot_unixfs::file::visit as file_visit;
use depot_unixfs::pb::{FlatUnixFs, UnixFsType};
use futures::future::{BoxFuture, FutureExt};
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Regular-file entries extracted concurrently per directory.
const MAX_CONCURRENT_ENTRIES: usize = 8;

/// Entries above this advertised size are written on the calling path instead of the pool.
const SERIAL_SIZE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Write buffer checked out of the pool per file.
const WRITE_BUFFER: usize = 4 * 1024 * 1024;

/// Progress callbacks fire once at least this much unreported extraction accumulated.
const PROGRESS_GRANULARITY: u64 = 256 * 1024;

/// Progress callback receiving the cumulative number of extracted bytes.
///
/// May fire from any worker; callers needing a single-threaded sink serialize externally.
pub type ExtractProgress = dyn Fn(u64) + Send + Sync;

/// Streams a stored tree to disk.
pub struct Extractor {
    store: BlockStore,
    root: Cid,
    dest: PathBuf,
    progress: Option<Arc<ExtractProgress>>,
}

impl Extractor {
    pub fn new(store: BlockStore, root: Cid, dest: impl Into<PathBuf>) -> Extractor {
        Extractor {
            store,
            root,
            dest: dest.into(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: impl Fn(u64) + Send + Sync + 'static) -> Extractor {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Extracts the tree below the root identifier into the destination directory.
    ///
    /// With `overwrite` disabled any existing non-directory target fails the extraction;
    /// directories always merge and are never removed. An existing regular file of the same size
    /// as its replacement is left untouched, though its size still counts as progress.
    pub async fn extract(self, cancel: &CancellationToken, overwrite: bool) -> Result<()> {
        if self.dest.as_os_str().is_empty() {
            return Err(Error::InvalidPath { path: self.dest });
        }

        let base = absolutize(&self.dest)?;

        let run = ExtractRun {
            shared: Arc::new(Shared {
                store: self.store,
                base: base.clone(),
                overwrite,
                progress: self.progress,
                extracted: AtomicU64::new(0),
                unreported: AtomicU64::new(0),
                workers: Arc::new(Semaphore::new(MAX_CONCURRENT_ENTRIES)),
                pool: BufferPool::default(),
            }),
        };

        let result = run.extract_node(self.root, base, cancel.child_token()).await;
        run.flush_progress();
        result
    }
}

/// Cheap-to-clone handle shared between the calling path and the pooled workers.
#[derive(Clone)]
struct ExtractRun {
    shared: Arc<Shared>,
}

struct Shared {
    store: BlockStore,
    base: PathBuf,
    overwrite: bool,
    progress: Option<Arc<ExtractProgress>>,
    extracted: AtomicU64,
    unreported: AtomicU64,
    workers: Arc<Semaphore>,
    pool: BufferPool,
}

impl ExtractRun {
    fn extract_node(
        &self,
        cid: Cid,
        target: PathBuf,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();

        async move {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let block = this.shared.store.get(&cid, &cancel).await?;
            this.extract_from_block(block, target, cancel).await
        }
        .boxed()
    }

    /// Dispatch on an already fetched node. Boxing here breaks the async recursion cycle of
    /// nested directories.
    fn extract_from_block(
        &self,
        block: Block,
        target: PathBuf,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();

        async move {
            if block.cid.codec() == depot_unixfs::RAW {
                return this.extract_file(block, target, cancel).await;
            }

            let kind = {
                let node = FlatUnixFs::try_from(block.data.as_ref()).map_err(|source| {
                    Error::InvalidNode {
                        cid: block.cid.clone(),
                        source,
                    }
                })?;
                node.data.Type
            };

            match kind {
                UnixFsType::Directory => this.extract_directory(block, target, cancel).await,
                UnixFsType::File | UnixFsType::Raw => {
                    this.extract_file(block, target, cancel).await
                }
                UnixFsType::Symlink => this.extract_symlink(block, target).await,
                other => Err(Error::UnsupportedFileType {
                    cid: block.cid,
                    type_code: other.into(),
                }),
            }
        }
        .boxed()
    }

    async fn extract_directory(
        &self,
        block: Block,
        target: PathBuf,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.prepare_directory(&target).await?;

        let entries = {
            let node = FlatUnixFs::try_from(block.data.as_ref()).map_err(|source| {
                Error::InvalidNode {
                    cid: block.cid.clone(),
                    source,
                }
            })?;
            directory_entries(&node).map_err(|source| Error::FileWalk {
                cid: block.cid.clone(),
                source,
            })?
        };

        // the children share one token: the first failure cancels the in-flight siblings while
        // completed ones stay on disk
        let children = cancel.child_token();
        let mut workers = Vec::new();
        let mut failure: Option<Error> = None;

        for entry in entries {
            if children.is_cancelled() || failure.is_some() {
                break;
            }

            if let Err(e) = self
                .dispatch_entry(&target, entry, &children, &mut workers)
                .await
            {
                failure = Some(e);
                children.cancel();
            }
        }

        for handle in workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    children.cancel();
                }
                Err(join) => {
                    if failure.is_none() {
                        failure = Some(if join.is_panic() {
                            Error::WorkerPanic {
                                context: format!("extracting under {:?}", target),
                            }
                        } else {
                            Error::Cancelled
                        });
                    }
                    children.cancel();
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Validates one directory entry and either handles it on the calling path or hands it to
    /// the worker pool. Only regular files go to the pool; directories, symlinks and anything
    /// over the size threshold stay serial.
    async fn dispatch_entry(
        &self,
        dir: &Path,
        entry: DirectoryEntry,
        cancel: &CancellationToken,
        workers: &mut Vec<tokio::task::JoinHandle<Result<()>>>,
    ) -> Result<()> {
        if entry.name.is_empty()
            || entry.name == "."
            || entry.name == ".."
            || entry.name.contains('/')
            || entry.name.contains('\\')
            || has_invalid_filename_chars(&entry.name)
        {
            return Err(Error::InvalidDirectoryEntry { name: entry.name });
        }

        let target = dir.join(&entry.name);

        if !is_subpath(&target, &self.shared.base) {
            return Err(Error::PathTraversal {
                path: target,
                base: self.shared.base.clone(),
            });
        }
        ensure_no_symlink_in_path(&self.shared.base, &target).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let block = self.shared.store.get(&entry.cid, cancel).await?;

        let is_regular_file = block.cid.codec() == depot_unixfs::RAW || {
            let node = FlatUnixFs::try_from(block.data.as_ref()).map_err(|source| {
                Error::InvalidNode {
                    cid: block.cid.clone(),
                    source,
                }
            })?;
            matches!(node.data.Type, UnixFsType::File | UnixFsType::Raw)
        };

        if is_regular_file && entry.total_size <= SERIAL_SIZE_THRESHOLD {
            let this = self.clone();
            let semaphore = Arc::clone(&self.shared.workers);
            let child_cancel = cancel.child_token();

            workers.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled)?;
                if child_cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                this.extract_file(block, target, child_cancel).await
            }));

            Ok(())
        } else {
            // directories, symlinks and oversized files run on the calling path
            self.extract_from_block(block, target, cancel.child_token())
                .await
        }
    }

    async fn prepare_directory(&self, target: &Path) -> Result<()> {
        match tokio::fs::symlink_metadata(target).await {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) => {
                // a non-directory stands where a directory must go
                if !self.shared.overwrite {
                    return Err(Error::PathExistsOverwrite {
                        path: target.to_path_buf(),
                    });
                }
                tokio::fs::remove_file(target)
                    .await
                    .map_err(|e| Error::io(target, e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(target, e)),
        }

        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);

        builder
            .create(target)
            .await
            .map_err(|e| Error::io(target, e))
    }

    async fn extract_file(
        &self,
        block: Block,
        target: PathBuf,
        cancel: CancellationToken,
    ) -> Result<()> {
        let walk_failed = |source| Error::FileWalk {
            cid: block.cid.clone(),
            source,
        };

        let (first, total, visit) =
            file_visit::start(&block.cid, block.data.as_ref()).map_err(&walk_failed)?;

        match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) => {
                if !self.shared.overwrite {
                    return Err(Error::PathExistsOverwrite { path: target });
                }
                if meta.is_file() && meta.len() == total {
                    // identical-size regular file: skip the write, account the bytes
                    tracing::trace!(target = %target.display(), "same size, skipping rewrite");
                    self.add_progress(total);
                    return Ok(());
                }
                if meta.is_dir() {
                    tokio::fs::remove_dir_all(&target)
                        .await
                        .map_err(|e| Error::io(&target, e))?;
                } else {
                    tokio::fs::remove_file(&target)
                        .await
                        .map_err(|e| Error::io(&target, e))?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&target, e)),
        }

        let part = part_path(&target);
        if self.shared.overwrite {
            // a stale part file from an interrupted run; safe to discard
            let _ = tokio::fs::remove_file(&part).await;
        }

        let file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::PathExistsOverwrite { path: part });
            }
            Err(e) => return Err(Error::io(&part, e)),
        };

        let mut writer = PooledWriter::new(file, &self.shared.pool);

        let result = async {
            writer.write(first).await.map_err(|e| Error::io(&part, e))?;
            self.add_progress(first.len() as u64);

            let mut visit = visit;
            while let Some(current) = visit {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let next = current
                    .pending_links()
                    .next()
                    .expect("a continuing visit always has a pending link")
                    .clone();

                let child = self.shared.store.get(&next, &cancel).await?;
                let (content, continued) = current
                    .continue_walk(&child.cid, child.data.as_ref())
                    .map_err(&walk_failed)?;

                writer
                    .write(content)
                    .await
                    .map_err(|e| Error::io(&part, e))?;
                self.add_progress(content.len() as u64);
                visit = continued;
            }

            writer.finish().await.map_err(|e| Error::io(&part, e))
        }
        .await;

        if let Err(e) = result {
            // the exclusive create above makes a leftover part safe to remove on reattempt
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }

        tokio::fs::rename(&part, &target)
            .await
            .map_err(|e| Error::io(&target, e))?;

        tracing::trace!(target = %target.display(), bytes = total, "extracted file");
        Ok(())
    }

    async fn extract_symlink(&self, block: Block, target_path: PathBuf) -> Result<()> {
        let link_target = {
            let node = FlatUnixFs::try_from(block.data.as_ref()).map_err(|source| {
                Error::InvalidNode {
                    cid: block.cid.clone(),
                    source,
                }
            })?;
            let bytes = symlink_target(&node).expect("dispatch checked the node type");
            match std::str::from_utf8(bytes) {
                Ok(target) => target.to_string(),
                Err(_) => {
                    return Err(Error::InvalidSymlinkTarget {
                        target: String::from_utf8_lossy(bytes).into_owned(),
                    });
                }
            }
        };

        if !validate_symlink_target(&link_target) {
            return Err(Error::InvalidSymlinkTarget {
                target: link_target,
            });
        }

        match tokio::fs::symlink_metadata(&target_path).await {
            Ok(meta) => {
                if !self.shared.overwrite {
                    return Err(Error::PathExistsOverwrite { path: target_path });
                }
                if meta.is_dir() {
                    tokio::fs::remove_dir_all(&target_path)
                        .await
                        .map_err(|e| Error::io(&target_path, e))?;
                } else {
                    tokio::fs::remove_file(&target_path)
                        .await
                        .map_err(|e| Error::io(&target_path, e))?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&target_path, e)),
        }

        #[cfg(unix)]
        {
            tokio::fs::symlink(&link_target, &target_path)
                .await
                .map_err(|e| Error::io(&target_path, e))?;
            tracing::trace!(target = %target_path.display(), "created symlink");
            Ok(())
        }

        #[cfg(not(unix))]
        {
            Err(Error::UnsupportedFileType {
                cid: block.cid,
                type_code: UnixFsType::Symlink.into(),
            })
        }
    }

    fn add_progress(&self, bytes: u64) {
        let total = self.shared.extracted.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let unreported = self.shared.unreported.fetch_add(bytes, Ordering::Relaxed) + bytes;

        if unreported >= PROGRESS_GRANULARITY {
            // claim via swap: a racing worker may have reported these bytes already and the
            // counter must never underflow
            if self.shared.unreported.swap(0, Ordering::Relaxed) > 0 {
                if let Some(progress) = self.shared.progress.as_ref() {
                    progress(total);
                }
            }
        }
    }

    fn flush_progress(&self) {
        let unreported = self.shared.unreported.swap(0, Ordering::Relaxed);
        if unreported > 0 {
            if let Some(progress) = self.shared.progress.as_ref() {
                progress(self.shared.extracted.load(Ordering::Relaxed));
            }
        }
    }
}

/// Streams the content bytes of a stored file without touching the filesystem.
///
/// Useful for inspecting a single file of an import; the tree-level safety checks of
/// [`Extractor`] do not apply because nothing is written.
pub fn stream_content(
    store: BlockStore,
    cid: Cid,
    cancel: CancellationToken,
) -> impl futures::Stream<Item = Result<Bytes>> {
    async_stream::try_stream! {
        let block = store.get(&cid, &cancel).await?;
        let (first, _, visit) = file_visit::start(&block.cid, block.data.as_ref())
            .map_err(|source| Error::FileWalk {
                cid: block.cid.clone(),
                source,
            })?;

        if !first.is_empty() {
            yield Bytes::copy_from_slice(first);
        }

        let mut visit = match visit {
            Some(visit) => visit,
            None => return,
        };

        loop {
            if cancel.is_cancelled() {
                Err(Error::Cancelled)?;
            }

            let next = visit
                .pending_links()
                .next()
                .expect("a continuing visit always has a pending link")
                .clone();

            let child = store.get(&next, &cancel).await?;
            let (content, continued) = visit
                .continue_walk(&child.cid, child.data.as_ref())
                .map_err(|source| Error::FileWalk {
                    cid: next.clone(),
                    source,
                })?;

            if !content.is_empty() {
                yield Bytes::copy_from_slice(content);
            }

            match continued {
                Some(continuing) => visit = continuing,
                None => break,
            }
        }
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .expect("extraction targets always have a file name")
        .to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

/// Reusable write buffers shared across the extraction workers.
#[derive(Default)]
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn take(&self) -> Vec<u8> {
        let recycled = self
            .buffers
            .lock()
            .expect("buffer pool lock never poisons")
            .pop();
        recycled.unwrap_or_else(|| Vec::with_capacity(WRITE_BUFFER))
    }

    fn put(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut buffers = self.buffers.lock().expect("buffer pool lock never poisons");
        if buffers.len() < MAX_CONCURRENT_ENTRIES {
            buffers.push(buffer);
        }
    }
}

/// Buffered file writer over a pooled buffer; flushes at the buffer capacity and fsyncs on
/// finish.
struct PooledWriter<'a> {
    file: tokio::fs::File,
    buffer: Vec<u8>,
    pool: &'a BufferPool,
}

impl<'a> PooledWriter<'a> {
    fn new(file: tokio::fs::File, pool: &'a BufferPool) -> Self {
        PooledWriter {
            file,
            buffer: pool.take(),
            pool,
        }
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.buffer.len() + data.len() > WRITE_BUFFER {
            self.flush().await?;
        }

        if data.len() >= WRITE_BUFFER {
            self.file.write_all(data).await
        } else {
            self.buffer.extend_from_slice(data);
            Ok(())
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer).await?;
            self.buffer.clear();
        }
        Ok(())
    }

    async fn finish(mut self) -> std::io::Result<()> {
        self.flush().await?;
        self.file.sync_all().await?;
        self.pool.put(std::mem::replace(&mut self.buffer, Vec::new()));
        Ok(())
    }
}
