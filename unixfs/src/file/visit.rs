use cid::Cid;

use crate::file::reader::{FileContent, FileReader};
use crate::file::{FileError, FileReadFailed};

/// Starts a depth-first visit over a file tree from its root block.
///
/// Returns any content carried by the root itself, the total size of the file, and the visit
/// state when the content continues in further blocks. Single-block files (including raw leaf
/// roots and empty files) complete immediately with `None`.
pub fn start<'a>(
    cid: &Cid,
    block: &'a [u8],
) -> Result<(&'a [u8], u64, Option<FileVisit>), FileReadFailed> {
    let reader = FileReader::from_block(cid, block)?;
    let total_size = reader.file_size();

    match reader.content()? {
        FileContent::Just(content) => Ok((content, total_size, None)),
        FileContent::Spread(links) => {
            let mut pending = links;
            // reversed so that the first subtree is popped first
            pending.reverse();

            Ok((
                &[][..],
                total_size,
                Some(FileVisit {
                    pending,
                    total_size,
                }),
            ))
        }
    }
}

/// An ongoing depth-first visitation of a file tree.
///
/// The caller fetches the block for the first `pending_links` entry and feeds it back through
/// [`FileVisit::continue_walk`]; content comes out strictly in file byte order. Every subtree is
/// validated to cover exactly the number of bytes its parent link advertised.
pub struct FileVisit {
    /// Pending subtrees as `(link, advertised bytes)`; the next one is the last item so it can be
    /// popped.
    pending: Vec<(Cid, u64)>,
    total_size: u64,
}

impl FileVisit {
    /// Access the links of all pending subtrees, next first, for prefetching purposes.
    pub fn pending_links(&self) -> impl Iterator<Item = &Cid> {
        self.pending.iter().rev().map(|(cid, _)| cid)
    }

    /// Total size of the file being visited in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Continues the walk with the block data for the first `pending_links` entry.
    ///
    /// Returns the content produced by this block and the visit state, or `None` when the walk
    /// completed.
    pub fn continue_walk<'a>(
        mut self,
        cid: &Cid,
        block: &'a [u8],
    ) -> Result<(&'a [u8], Option<Self>), FileReadFailed> {
        let (_, expected) = self
            .pending
            .pop()
            .expect("continue_walk must only be called when a pending link exists");

        let reader = FileReader::from_block(cid, block)?;

        if reader.file_size() != expected {
            return Err(FileError::SubtreeSizeMismatch {
                expected,
                actual: reader.file_size(),
            }
            .into());
        }

        match reader.content()? {
            FileContent::Just(content) => {
                if self.pending.is_empty() {
                    Ok((content, None))
                } else {
                    Ok((content, Some(self)))
                }
            }
            FileContent::Spread(links) => {
                let before = self.pending.len();
                self.pending.extend(links);
                // keep the depth-first order: the first child must be the next pop
                self.pending[before..].reverse();

                Ok((&[][..], Some(self)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::adder::FileAdder;
    use std::collections::HashMap;

    fn drive(blocks: &HashMap<Cid, Vec<u8>>, root: &Cid) -> (Vec<u8>, u64) {
        let root_block = &blocks[root];
        let (content, total, visit) = start(root, root_block).unwrap();
        let mut combined = content.to_vec();

        let mut visit = visit;
        while let Some(current) = visit {
            let next = current
                .pending_links()
                .next()
                .expect("pending visit must have a next link")
                .clone();
            let block = &blocks[&next];
            let (content, continued) = current.continue_walk(&next, block).unwrap();
            combined.extend_from_slice(content);
            visit = continued;
        }

        (combined, total)
    }

    fn add_all(content: &[u8]) -> (HashMap<Cid, Vec<u8>>, Cid) {
        let mut adder = FileAdder::default();
        let mut blocks = HashMap::new();
        let mut last = None;

        let mut remaining = content;
        while !remaining.is_empty() {
            let (produced, consumed) = adder.push(remaining);
            remaining = &remaining[consumed..];
            for (cid, block) in produced {
                last = Some(cid.clone());
                blocks.insert(cid, block);
            }
        }
        for (cid, block) in adder.finish() {
            last = Some(cid.clone());
            blocks.insert(cid, block);
        }

        (blocks, last.expect("adder always produces a root"))
    }

    #[test]
    fn single_block_roundtrip() {
        let (blocks, root) = add_all(b"foobar\n");
        let (combined, total) = drive(&blocks, &root);
        assert_eq!(combined, b"foobar\n");
        assert_eq!(total, 7);
    }

    #[test]
    fn multi_block_roundtrip() {
        // 2.5 chunks; the prime modulus keeps the chunks distinct under deduplication
        let content = (0..5 * 512 * 1024usize)
            .map(|i| (i % 251) as u8)
            .collect::<Vec<_>>();

        let (blocks, root) = add_all(&content);
        assert_eq!(blocks.len(), 4, "three distinct leaves plus the root");

        let (combined, total) = drive(&blocks, &root);
        assert_eq!(total, content.len() as u64);
        assert_eq!(combined, content);
    }

    #[test]
    fn empty_file_roundtrip() {
        let (blocks, root) = add_all(b"");
        assert_eq!(blocks.len(), 1);
        let (combined, total) = drive(&blocks, &root);
        assert_eq!(total, 0);
        assert!(combined.is_empty());
    }
}
