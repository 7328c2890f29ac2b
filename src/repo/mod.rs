//! Repository lifecycle: the on-disk layout, its exclusive lock and the block-level API.

use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub mod blockstore;
pub mod datastore;
pub(crate) mod flatfs;
pub(crate) mod lock;
pub(crate) mod mount;
pub(crate) mod sledds;

pub use blockstore::{parse_cid, Block, BlockStore, MAX_BLOCK_SIZE};
pub use datastore::{Batch, Datastore, MemDatastore};

use flatfs::FlatFsDatastore;
use lock::RepoLock;
use mount::{DatastoreSpec, MountDatastore};
use sledds::SledDatastore;

const SPEC_FILE: &str = "datastore_spec";
const LOCK_FILE: &str = ".storage.lock";

/// A repository owns one datastore assembly and the exclusive lock over its directory.
///
/// Opening blocks until any other process holding the same repository releases it. The handle is
/// cheap to clone and safe to share; `close` and `destroy` are idempotent.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

struct RepoInner {
    path: PathBuf,
    datastore: Arc<MountDatastore>,
    lock: Mutex<Option<RepoLock>>,
}

impl Repository {
    /// Opens (creating when necessary) the repository at `path`.
    ///
    /// An existing repository must carry a `datastore_spec` which matches the configured layout
    /// byte-for-byte; anything else aborts with [`Error::ConfigMismatch`].
    pub async fn open(path: impl AsRef<Path>) -> Result<Repository> {
        let path = path.as_ref().to_path_buf();

        if path.as_os_str().is_empty() {
            return Err(Error::InvalidPath { path });
        }

        create_repo_dir(&path)?;

        let spec = DatastoreSpec::default_layout();
        check_or_init_spec(&path, &spec).await?;

        // the lock blocks until any current holder releases, off the async threads
        let lock_path = path.join(LOCK_FILE);
        let lock = tokio::task::spawn_blocking(move || RepoLock::acquire(lock_path))
            .await
            .map_err(|_| Error::WorkerPanic {
                context: "acquiring the repository lock".to_string(),
            })??;

        let datastore = assemble_datastore(&path, &spec).await?;

        tracing::debug!(path = %path.display(), "repository opened");

        Ok(Repository {
            inner: Arc::new(RepoInner {
                path,
                datastore,
                lock: Mutex::new(Some(lock)),
            }),
        })
    }

    /// Block-level access; clones share the repository's datastore.
    pub fn block_store(&self) -> BlockStore {
        BlockStore::new(self.inner.datastore.clone())
    }

    /// The directory this repository lives in.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Total bytes used by the underlying datastores.
    pub async fn disk_usage(&self) -> Result<u64> {
        self.inner.datastore.disk_usage().await
    }

    /// Flushes the datastores and releases the lock. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        self.inner.datastore.close().await?;

        let released = self
            .inner
            .lock
            .lock()
            .expect("repository lock mutex never poisons")
            .take();
        if released.is_some() {
            tracing::debug!(path = %self.inner.path.display(), "repository closed");
        }

        Ok(())
    }

    /// Closes the repository and removes its directory. Safe to call repeatedly.
    pub async fn destroy(&self) -> Result<()> {
        self.close().await?;

        match tokio::fs::remove_dir_all(&self.inner.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&self.inner.path, e)),
        }
    }
}

fn create_repo_dir(path: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o750);
    }

    builder.create(path).map_err(|e| Error::io(path, e))
}

async fn check_or_init_spec(path: &Path, spec: &DatastoreSpec) -> Result<()> {
    let spec_path = path.join(SPEC_FILE);
    let canonical = spec.canonical();

    match tokio::fs::read(&spec_path).await {
        Ok(existing) => {
            if existing != canonical.as_bytes() {
                return Err(Error::ConfigMismatch { path: spec_path });
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::write(&spec_path, canonical.as_bytes())
                .await
                .map_err(|e| Error::io(&spec_path, e))
        }
        Err(e) => Err(Error::io(&spec_path, e)),
    }
}

async fn assemble_datastore(path: &Path, spec: &DatastoreSpec) -> Result<Arc<MountDatastore>> {
    let mut mounts: Vec<(String, Arc<dyn Datastore>)> = Vec::with_capacity(spec.mounts.len());

    for mount in &spec.mounts {
        let child_path = path.join(&mount.path);
        let store: Arc<dyn Datastore> = match mount.kind.as_str() {
            "flatfs" => FlatFsDatastore::open(child_path, mount.sync.unwrap_or(false)).await?,
            "sled" => {
                tokio::task::spawn_blocking(move || SledDatastore::open(&child_path))
                    .await
                    .map_err(|_| Error::WorkerPanic {
                        context: "opening the sled datastore".to_string(),
                    })??
            }
            other => {
                return Err(Error::StorageFailure {
                    source: anyhow::anyhow!("unknown datastore kind {:?} in spec", other),
                });
            }
        };
        mounts.push((mount.mountpoint.clone(), store));
    }

    Ok(Arc::new(MountDatastore::new(mounts)))
}
