//! `depot` is an embedded content-addressed file repository.
//!
//! Files and directory trees are imported into a local, durable block store keyed by
//! cryptographic digest; the returned root identifier later reconstructs a byte-identical tree
//! on disk. Blocks deduplicate by content, so equal files and equal subtrees are stored once.
//!
//! ```no_run
//! # async fn example() -> Result<(), depot::Error> {
//! use depot::{CancellationToken, Extractor, Importer, Repository};
//!
//! let repo = Repository::open("/var/lib/depot").await?;
//! let cancel = CancellationToken::new();
//!
//! let result = Importer::new(repo.block_store(), "/home/me/photos")
//!     .with_progress(|done, total, file| eprintln!("{}/{} {}", done, total, file))
//!     .import(&cancel)
//!     .await?;
//!
//! Extractor::new(repo.block_store(), result.root_cid, "/tmp/restored")
//!     .extract(&cancel, false)
//!     .await?;
//!
//! repo.close().await?;
//! # Ok(())
//! # }
//! ```

mod error;
pub mod extract;
pub mod import;
pub mod path;
pub mod repo;

pub use error::{Error, Result};
pub use extract::{stream_content, ExtractProgress, Extractor};
pub use import::{FileEntry, ImportProgress, ImportResult, Importer, Package};
pub use repo::{parse_cid, Block, BlockStore, Repository, MAX_BLOCK_SIZE};

pub use cid::Cid;
pub use tokio_util::sync::CancellationToken;
