use crate::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Exclusive advisory lock over a repository directory.
///
/// Acquisition blocks until any current holder releases; once held, the file contains this
/// process id as decimal ASCII. Dropping the guard releases the lock. The file itself is left in
/// place: a waiter blocked on the same inode must acquire the very file a later opener would
/// lock, so unlinking here would allow two holders.
pub(crate) struct RepoLock {
    file: File,
    path: PathBuf,
}

impl RepoLock {
    /// Blocks the calling thread until the lock is acquired. Call from a blocking-capable
    /// context.
    pub(crate) fn acquire(path: PathBuf) -> Result<RepoLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|source| Error::LockHeld {
                path: path.clone(),
                source,
            })?;

        file.lock_exclusive().map_err(|source| Error::LockHeld {
            path: path.clone(),
            source,
        })?;

        let write_pid = |mut file: &File| -> std::io::Result<()> {
            file.set_len(0)?;
            write!(file, "{}", std::process::id())?;
            file.sync_all()
        };

        if let Err(source) = write_pid(&file) {
            let _ = file.unlock();
            return Err(Error::LockHeld { path, source });
        }

        tracing::trace!(path = %path.display(), "repository lock acquired");
        Ok(RepoLock { file, path })
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        tracing::trace!(path = %self.path.display(), "repository lock released");
    }
}
