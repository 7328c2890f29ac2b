use crate::pb::UnixFsReadFailed;
use std::borrow::Cow;
use std::fmt;

pub mod adder;
pub mod reader;
pub mod visit;

/// Describes the errors which can happen during a visit or lower level block-by-block walking of
/// a file DAG.
#[derive(Debug)]
pub enum FileReadFailed {
    /// The file tree is malformed in a way we cannot process.
    File(FileError),
    /// The block was a UnixFS node but not of file or raw type.
    // raw value by design, not to expose the protobuf types
    UnexpectedType(i32),
    /// Parsing failed.
    Read(UnixFsReadFailed),
    /// A link in the tree did not contain a valid Cid.
    LinkInvalidCid {
        nth: usize,
        hash: Vec<u8>,
        name: Cow<'static, str>,
        cause: cid::Error,
    },
}

impl fmt::Display for FileReadFailed {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FileReadFailed::*;

        match self {
            File(e) => write!(fmt, "{}", e),
            UnexpectedType(t) => write!(fmt, "unexpected type for a file block: {}", t),
            Read(e) => write!(fmt, "reading failed: {}", e),
            LinkInvalidCid {
                nth, name, cause, ..
            } => write!(
                fmt,
                "failed to convert link #{} ({:?}) to Cid: {}",
                nth, name, cause
            ),
        }
    }
}

impl std::error::Error for FileReadFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use FileReadFailed::*;

        match self {
            File(e) => Some(e),
            Read(e) => Some(e),
            LinkInvalidCid { cause, .. } => Some(cause),
            UnexpectedType(_) => None,
        }
    }
}

impl From<UnixFsReadFailed> for FileReadFailed {
    fn from(e: UnixFsReadFailed) -> Self {
        FileReadFailed::Read(e)
    }
}

impl From<FileError> for FileReadFailed {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

/// Errors which can happen while processing UnixFS type File or Raw blocks.
#[derive(Debug, PartialEq)]
pub enum FileError {
    /// There are nonequal number of links and blocksizes and thus the file ranges for linked trees
    /// or blocks cannot be determined.
    LinksAndBlocksizesMismatch,
    /// The declared filesize does not match the inline content of a leaf.
    NoLinksNoContent,
    /// A non-leaf node in the tree has no filesize value, which is needed to validate the subtree.
    IntermediateNodeWithoutFileSize,
    /// A subtree covered a different number of file bytes than its parent link advertised.
    SubtreeSizeMismatch { expected: u64, actual: u64 },
}

impl fmt::Display for FileError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FileError::*;
        match self {
            LinksAndBlocksizesMismatch => write!(
                fmt,
                "different number of links and blocksizes: cannot determine subtree ranges"
            ),
            NoLinksNoContent => write!(
                fmt,
                "filesize does not match the content while there are no links"
            ),
            IntermediateNodeWithoutFileSize => {
                write!(fmt, "intermediary node with links but no filesize")
            }
            SubtreeSizeMismatch { expected, actual } => write!(
                fmt,
                "subtree covered {} bytes while the link advertised {}",
                actual, expected
            ),
        }
    }
}

impl std::error::Error for FileError {}
