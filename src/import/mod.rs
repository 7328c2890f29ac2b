//! Importing file trees into the block store.
//!
//! The walk feeds one [`FileAdder`] per file and accumulates directory shape in a
//! [`TreeBuilder`]; produced blocks are staged and committed through the datastore's batch
//! primitive. Once the tree is flushed, the reachable block set is grouped into verification
//! packages.

use crate::path::{clean_filename, clean_or_fallback};
use crate::repo::{Block, BlockStore};
use crate::{Error, Result};
use cid::Cid;
use depot_unixfs::dir::builder::TreeBuilder;
use depot_unixfs::file::adder::FileAdder;
use depot_unixfs::symlink::serialize_symlink_block;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

mod package;

pub use package::{Package, PACKAGE_CAPACITY};

/// Entries accumulated in memory before the directory tree is flushed to blocks.
const LIVE_NODE_FLUSH_THRESHOLD: usize = 256 * 1024;

/// Bytes of produced blocks staged before a batch commit.
const STAGE_LIMIT: usize = 100 * 1024 * 1024;

/// Read buffer for file chunking.
const READ_BUFFER: usize = 256 * 1024;

/// Name of the synthetic directory wrapped around a single-file import.
const SINGLE_FILE_WRAPPER: &str = "folder";

/// Progress callback: `(processed_bytes, total_bytes, current_file)`.
///
/// May be invoked from whichever task performed the read; callers needing a single-threaded sink
/// serialize externally. Reports for one file are monotone non-decreasing.
pub type ImportProgress = dyn Fn(u64, u64, &str) + Send + Sync;

/// A single imported file in [`ImportResult::contents`].
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Cleaned path relative to the imported root.
    pub name: String,
    /// Content bytes.
    pub size: u64,
}

/// The outcome of an import.
#[derive(Debug, Clone)]
pub struct ImportResult {
    /// Cleaned name of the imported top-level entry.
    pub file_name: String,
    /// Total content bytes imported; equals the sum over `contents`.
    pub total_size: u64,
    /// Root identifier to extract from later.
    pub root_cid: Cid,
    /// Verification manifests over every block reachable from the root.
    pub packages: Vec<Package>,
    /// Per-file names and sizes in walk order.
    pub contents: Vec<FileEntry>,
}

/// Imports a file or directory tree into a block store.
pub struct Importer {
    store: BlockStore,
    source: PathBuf,
    progress: Option<Arc<ImportProgress>>,
}

impl Importer {
    pub fn new(store: BlockStore, source: impl Into<PathBuf>) -> Importer {
        Importer {
            store,
            source: source.into(),
            progress: None,
        }
    }

    pub fn with_progress(
        mut self,
        progress: impl Fn(u64, u64, &str) + Send + Sync + 'static,
    ) -> Importer {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Runs the import. Blocks already written when cancellation fires stay in the store; they
    /// are content-addressed orphans and harmless.
    pub async fn import(self, cancel: &CancellationToken) -> Result<ImportResult> {
        // the source argument itself is followed if it is a symlink
        let meta = tokio::fs::metadata(&self.source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::InvalidPath {
                    path: self.source.clone(),
                }
            } else {
                Error::io(&self.source, e)
            }
        })?;

        let original_name = match self.source.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => {
                return Err(Error::InvalidPath {
                    path: self.source.clone(),
                });
            }
        };

        let mut run = ImportRun {
            store: self.store,
            progress: self.progress,
            cancel,
            is_interrupted: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            total: 0,
            tree: TreeBuilder::new(),
            seen_names: HashMap::new(),
            staged: Vec::new(),
            staged_bytes: 0,
            live_nodes: 0,
            contents: Vec::new(),
        };

        let file_name = if meta.is_dir() {
            let top = clean_or_fallback(&original_name, true);
            run.total = scan_total(&self.source).await?;
            run.tree
                .mkdir(&[top.as_str()])
                .map_err(|source| Error::TreeBuilding { source })?;
            run.walk(&self.source, vec![top.clone()]).await?;
            top
        } else if meta.is_file() {
            let cleaned = clean_or_fallback(&original_name, false);
            run.total = meta.len();
            // single files are wrapped so every import presents the same two-level shape
            let path = vec![SINGLE_FILE_WRAPPER.to_string(), cleaned.clone()];
            run.import_file(&self.source, path, cleaned.clone()).await?;
            cleaned
        } else {
            return Err(Error::InvalidPath {
                path: self.source.clone(),
            });
        };

        run.flush_tree().await?;
        run.commit_staged().await?;

        let root = run
            .tree
            .root()
            .expect("the tree was flushed above")
            .clone();

        tracing::debug!(root = %root.cid, files = run.contents.len(), "import committed");

        let packages = package::assemble(&run.store, &root.cid, cancel).await?;

        Ok(ImportResult {
            file_name,
            total_size: run.processed.load(Ordering::Relaxed),
            root_cid: root.cid,
            packages,
            contents: run.contents,
        })
    }
}

struct ImportRun<'a> {
    store: BlockStore,
    progress: Option<Arc<ImportProgress>>,
    cancel: &'a CancellationToken,
    /// Fast-exit flag shared with any worker context; set once cancellation is observed.
    is_interrupted: AtomicBool,
    processed: AtomicU64,
    total: u64,
    tree: TreeBuilder,
    /// Cleaned name registry per virtual directory, for duplicate detection citing originals.
    seen_names: HashMap<String, HashMap<String, String>>,
    staged: Vec<Block>,
    staged_bytes: usize,
    live_nodes: usize,
    contents: Vec<FileEntry>,
}

impl<'a> ImportRun<'a> {
    fn checkpoint(&self) -> Result<()> {
        if self.is_interrupted.load(Ordering::Relaxed) {
            return Err(Error::Interrupted);
        }
        if self.cancel.is_cancelled() {
            self.is_interrupted.store(true, Ordering::Relaxed);
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Registers a cleaned name within its virtual directory, refusing collisions.
    fn register(&mut self, dir: &[String], cleaned: &str, original: &str) -> Result<()> {
        let names = self.seen_names.entry(dir.join("/")).or_default();

        if let Some(first) = names.get(cleaned) {
            return Err(Error::DuplicateEntry {
                first: first.clone(),
                second: original.to_string(),
            });
        }

        names.insert(cleaned.to_string(), original.to_string());
        Ok(())
    }

    async fn walk(&mut self, dir: &Path, virtual_path: Vec<String>) -> Result<()> {
        let mut pending = vec![(dir.to_path_buf(), virtual_path)];

        while let Some((dir, vpath)) = pending.pop() {
            self.checkpoint()?;

            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| Error::io(&dir, e))?;

            let mut collected = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::io(&dir, e))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::io(entry.path(), e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let cleaned = clean_or_fallback(&name, file_type.is_dir());
                collected.push((cleaned, name, file_type, entry.path()));
            }

            // lexicographic order of cleaned names keeps the walk reproducible
            collected.sort_by(|a, b| a.0.cmp(&b.0));

            // subdirectories are deferred; reversed so the stack pops them back in order
            let mut subdirs = Vec::new();

            for (cleaned, original, file_type, disk_path) in collected {
                self.checkpoint()?;

                let entry_path = if original.contains('\\') {
                    self.nested_components(&vpath, &original)?
                } else {
                    self.register(&vpath, &cleaned, &original)?;
                    let mut path = vpath.clone();
                    path.push(cleaned);
                    path
                };

                if file_type.is_dir() {
                    self.mkdir(&entry_path).await?;
                    subdirs.push((disk_path, entry_path));
                } else if file_type.is_file() {
                    let display = entry_path[1..].join("/");
                    self.import_file(&disk_path, entry_path, display).await?;
                } else if file_type.is_symlink() {
                    self.import_symlink(&disk_path, &entry_path).await?;
                } else {
                    tracing::debug!(path = %disk_path.display(), "skipping special file");
                }
            }

            subdirs.reverse();
            pending.extend(subdirs);
        }

        Ok(())
    }

    /// Expands an entry name containing backslashes into nested, individually cleaned path
    /// components below `vpath`, creating the intermediate directories.
    fn nested_components(&mut self, vpath: &[String], original: &str) -> Result<Vec<String>> {
        let mut path = vpath.to_vec();

        let components = original.split('\\').collect::<Vec<_>>();
        let last = components.len() - 1;

        for (i, component) in components.iter().enumerate() {
            if *component == ".." {
                return Err(Error::PathTraversalAttempt {
                    name: original.to_string(),
                });
            }

            let cleaned = clean_filename(component);
            if cleaned.is_empty() {
                return Err(Error::InvalidPathComponent {
                    name: original.to_string(),
                });
            }

            if i == last {
                self.register(&path, &cleaned, original)?;
            }

            path.push(cleaned);

            if i < last {
                self.tree
                    .mkdir(&as_refs(&path))
                    .map_err(|source| Error::TreeBuilding { source })?;
            }
        }

        Ok(path)
    }

    async fn mkdir(&mut self, path: &[String]) -> Result<()> {
        self.tree
            .mkdir(&as_refs(path))
            .map_err(|source| Error::TreeBuilding { source })?;
        self.bump_live_nodes().await
    }

    async fn import_file(
        &mut self,
        disk_path: &Path,
        entry_path: Vec<String>,
        display: String,
    ) -> Result<()> {
        self.checkpoint()?;

        let file = tokio::fs::File::open(disk_path)
            .await
            .map_err(|e| Error::io(disk_path, e))?;
        let mut reader = tokio::io::BufReader::with_capacity(READ_BUFFER, file);

        let mut adder = FileAdder::default();
        let mut file_bytes = 0u64;
        let mut dag_bytes = 0u64;
        let mut root = None;

        loop {
            self.checkpoint()?;

            let buffer = reader
                .fill_buf()
                .await
                .map_err(|e| Error::io(disk_path, e))?;
            if buffer.is_empty() {
                break;
            }

            let mut consumed_total = 0;
            while consumed_total < buffer.len() {
                let (blocks, consumed) = adder.push(&buffer[consumed_total..]);
                consumed_total += consumed;

                for (cid, data) in blocks {
                    dag_bytes += data.len() as u64;
                    root = Some(cid.clone());
                    self.stage(Block {
                        cid,
                        data: data.into(),
                    })
                    .await?;
                }
            }

            reader.consume(consumed_total);
            file_bytes += consumed_total as u64;
            self.report(consumed_total as u64, &display);
        }

        for (cid, data) in adder.finish() {
            dag_bytes += data.len() as u64;
            root = Some(cid.clone());
            self.stage(Block {
                cid,
                data: data.into(),
            })
            .await?;
        }

        let root = root.expect("the adder always produces at least one block");

        self.tree
            .put_leaf(&as_refs(&entry_path), root, dag_bytes)
            .map_err(|source| Error::TreeBuilding { source })?;
        self.bump_live_nodes().await?;

        self.contents.push(FileEntry {
            name: display,
            size: file_bytes,
        });

        Ok(())
    }

    async fn import_symlink(&mut self, disk_path: &Path, entry_path: &[String]) -> Result<()> {
        let target = tokio::fs::read_link(disk_path)
            .await
            .map_err(|e| Error::io(disk_path, e))?;
        let target = target.to_string_lossy().into_owned();

        let (cid, block) = serialize_symlink_block(&target);
        let size = block.len() as u64;
        self.stage(Block {
            cid: cid.clone(),
            data: block.into(),
        })
        .await?;

        self.tree
            .put_leaf(&as_refs(entry_path), cid, size)
            .map_err(|source| Error::TreeBuilding { source })?;
        self.bump_live_nodes().await
    }

    fn report(&self, read: u64, current_file: &str) {
        let processed = self.processed.fetch_add(read, Ordering::Relaxed) + read;
        if let Some(progress) = self.progress.as_ref() {
            progress(processed, self.total, current_file);
        }
    }

    async fn stage(&mut self, block: Block) -> Result<()> {
        self.staged_bytes += block.data.len();
        self.staged.push(block);

        if self.staged_bytes >= STAGE_LIMIT {
            self.commit_staged().await?;
        }
        Ok(())
    }

    async fn commit_staged(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }

        let blocks = std::mem::replace(&mut self.staged, Vec::new());
        self.staged_bytes = 0;
        self.store.put_many_blocks(blocks, self.cancel).await
    }

    async fn bump_live_nodes(&mut self) -> Result<()> {
        self.live_nodes += 1;
        if self.live_nodes > LIVE_NODE_FLUSH_THRESHOLD {
            // bounds peak memory on very wide trees; superseded directory renderings become
            // benign orphans in the content-addressed store
            self.checkpoint()?;
            self.flush_tree().await?;
            self.live_nodes = 0;
        }
        Ok(())
    }

    async fn flush_tree(&mut self) -> Result<()> {
        let blocks = self
            .tree
            .flush()
            .map_err(|source| Error::TreeConstruction { source })?;

        for (cid, data) in blocks {
            self.stage(Block {
                cid,
                data: data.into(),
            })
            .await?;
        }

        Ok(())
    }
}

fn as_refs(path: &[String]) -> Vec<&str> {
    path.iter().map(|s| s.as_str()).collect()
}

/// Pre-computes the total content bytes below `root` so progress can report against a fixed
/// denominator before the first chunk is read.
async fn scan_total(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::io(&dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(&dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| Error::io(entry.path(), e))?;

            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| Error::io(entry.path(), e))?;
                total += meta.len();
            }
        }
    }

    Ok(total)
}
