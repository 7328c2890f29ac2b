use cid::Cid;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// All the ways repository operations can fail.
///
/// Every variant keeps the failure that caused it reachable through
/// [`std::error::Error::source`], so callers can both match on the kind and walk the chain.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Empty or malformed source or destination path.
    #[error("invalid path: {path:?}")]
    InvalidPath { path: PathBuf },

    /// The on-disk datastore spec differs from the configured one.
    #[error("datastore layout mismatch at {path:?}: repository was initialized differently")]
    ConfigMismatch { path: PathBuf },

    /// The repository lock could not be acquired or maintained.
    #[error("repository lock at {path:?} failed")]
    LockHeld {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A block exceeded the configured ceiling.
    #[error("block of {size} bytes exceeds the limit of {limit} bytes")]
    BlockTooLarge { size: usize, limit: usize },

    /// Producing the multihash for a block failed.
    #[error("hashing the block failed")]
    HashFailure {
        #[source]
        source: multihash::Error,
    },

    /// A block identifier could not be parsed.
    #[error("invalid cid: {value:?}")]
    CidInvalid {
        value: String,
        #[source]
        source: cid::Error,
    },

    /// The block was not found, after retries where they apply.
    #[error("block not found: {cid}")]
    BlockNotFound { cid: Cid },

    /// The underlying datastore failed.
    #[error("datastore operation failed")]
    StorageFailure {
        #[source]
        source: anyhow::Error,
    },

    /// A target path escaped the extraction base, or an ancestor of it is a symlink.
    #[error("target {path:?} escapes the extraction root {base:?}")]
    PathTraversal { path: PathBuf, base: PathBuf },

    /// A symlink in the tree points at an absolute path or outside the tree.
    #[error("symlink target {target:?} is absolute or escapes the tree")]
    InvalidSymlinkTarget { target: String },

    /// The target exists and overwriting was not requested.
    #[error("{path:?} exists and overwrite is disabled")]
    PathExistsOverwrite { path: PathBuf },

    /// A directory entry name which cannot be materialized on disk.
    #[error("invalid directory entry name {name:?}")]
    InvalidDirectoryEntry { name: String },

    /// A component of a nested entry name cleaned down to nothing.
    #[error("invalid path component in entry {name:?}")]
    InvalidPathComponent { name: String },

    /// A nested entry name tried to walk out of its directory.
    #[error("path traversal attempt in entry {name:?}")]
    PathTraversalAttempt { name: String },

    /// Two names in one directory cleaned to the same string.
    #[error("entries {first:?} and {second:?} collide after filename cleaning")]
    DuplicateEntry { first: String, second: String },

    /// A DAG node which is not a file, directory or symlink.
    #[error("unsupported node type {type_code} at {cid}")]
    UnsupportedFileType { cid: Cid, type_code: i32 },

    /// The cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The cooperative interrupt flag was set.
    #[error("operation interrupted")]
    Interrupted,

    /// Walking a file tree failed on the given block.
    #[error("file walk failed on {cid}")]
    FileWalk {
        cid: Cid,
        #[source]
        source: depot_unixfs::file::FileReadFailed,
    },

    /// Decoding a node of the tree failed.
    #[error("decoding {cid} failed")]
    InvalidNode {
        cid: Cid,
        #[source]
        source: depot_unixfs::pb::UnixFsReadFailed,
    },

    /// Accumulating the in-memory directory tree failed.
    #[error("building the directory tree failed")]
    TreeBuilding {
        #[source]
        source: depot_unixfs::dir::builder::TreeBuildingFailed,
    },

    /// Rendering directory nodes failed.
    #[error("constructing directory nodes failed")]
    TreeConstruction {
        #[source]
        source: depot_unixfs::dir::builder::TreeConstructionFailed,
    },

    /// Filesystem input or output failed.
    #[error("i/o failed on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A bounded-parallelism worker panicked; the panic was recovered into this error.
    #[error("worker panicked while {context}")]
    WorkerPanic { context: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn storage(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::StorageFailure {
            source: anyhow::Error::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use std::error::Error as _;

    #[test]
    fn causes_stay_reachable() {
        let inner = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = Error::io("/some/where", inner);

        let source = err.source().expect("io errors carry their cause");
        assert_eq!(source.to_string(), "nope");
    }

    #[test]
    fn storage_failures_wrap_any_error() {
        let err = Error::storage(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"));
        assert!(err.source().is_some());
    }
}
