use crate::pb::{FlatUnixFs, PBLink, UnixFs, UnixFsType};
use crate::{dag_pb_cid, raw_cid};
use cid::Cid;
use std::borrow::Cow;

/// Chunker strategy for splitting the incoming byte stream into leaves.
enum Chunker {
    /// Fixed size chunking; the final chunk may be short.
    Size(usize),
}

impl std::default::Default for Chunker {
    fn default() -> Self {
        Chunker::Size(1024 * 1024)
    }
}

impl Chunker {
    fn accept<'a>(&self, input: &'a [u8], buffered: usize) -> (&'a [u8], bool) {
        use Chunker::*;

        match self {
            Size(max) => {
                let remaining = max - buffered;
                if input.len() >= remaining {
                    (&input[..remaining], true)
                } else {
                    (input, false)
                }
            }
        }
    }
}

/// A link to a completed subtree, carried between the levels of the balanced collector.
#[derive(Debug, Clone)]
struct Link {
    cid: Cid,
    /// Cumulative encoded size of the subtree in the block store.
    total_size: u64,
    /// Number of file content bytes the subtree covers.
    file_size: u64,
}

/// File tree builder: chunks pushed bytes into raw leaves and collects them into a balanced tree
/// of dag-pb file nodes.
///
/// Blocks come out of [`FileAdder::push`] and [`FileAdder::finish`] as `(Cid, bytes)` pairs for
/// the caller to persist; the last block produced is always the root of the file. Equal inputs
/// produce equal block sequences.
pub struct FileAdder {
    chunker: Chunker,
    block_buffer: Vec<u8>,
    /// Collector levels; `levels[0]` holds leaves, each higher level holds links to completed
    /// nodes of the level below. A level collapses into a node of the next level when it reaches
    /// the fanout.
    levels: Vec<Vec<Link>>,
    fanout: usize,
    total_written: u64,
}

impl std::default::Default for FileAdder {
    /// Creates a `FileAdder` with 1 MiB chunks and the conventional balanced tree width of 174.
    fn default() -> Self {
        FileAdder {
            chunker: Chunker::default(),
            block_buffer: Vec::new(),
            levels: Vec::new(),
            fanout: 174,
            total_written: 0,
        }
    }
}

impl FileAdder {
    /// Pushes bytes into the adder, returning the blocks which completed and the number of input
    /// bytes consumed. Callers must re-push the unconsumed tail.
    pub fn push(&mut self, input: &[u8]) -> (impl Iterator<Item = (Cid, Vec<u8>)>, usize) {
        let (accepted, ready) = self.chunker.accept(input, self.block_buffer.len());

        if self.block_buffer.is_empty() && ready {
            // skip the copy when a full chunk is available up front
            self.total_written += accepted.len() as u64;
            let out = self.complete_chunk(accepted.to_vec());
            return (out.into_iter(), accepted.len());
        }

        self.block_buffer.extend_from_slice(accepted);
        self.total_written += accepted.len() as u64;

        let out = if ready {
            let chunk = std::mem::replace(&mut self.block_buffer, Vec::new());
            self.complete_chunk(chunk)
        } else {
            Vec::new()
        };

        (out.into_iter(), accepted.len())
    }

    /// Completes the file, flushing any buffered partial chunk and collapsing the collector
    /// levels into the root. The root block is the last item produced.
    pub fn finish(mut self) -> impl Iterator<Item = (Cid, Vec<u8>)> {
        let mut out = Vec::new();

        if !self.block_buffer.is_empty() || self.total_written == 0 {
            // the final short chunk, or the single empty leaf of an empty file
            let chunk = std::mem::replace(&mut self.block_buffer, Vec::new());
            out.extend(self.leaf(chunk));
        }

        let mut level = 0;
        while level < self.levels.len() {
            let any_above = self.levels[level + 1..].iter().any(|l| !l.is_empty());
            let len = self.levels[level].len();

            if len == 0 {
                level += 1;
                continue;
            }

            if len == 1 {
                if !any_above {
                    // single link at the top: this is the root
                    break;
                }
                // a lone trailing subtree attaches directly to the parent level, keeping the
                // same shape go-ipfs produces for trailing remainders
                let link = self.levels[level].pop().expect("len was checked above");
                self.push_link(level + 1, link);
            } else {
                out.push(self.collapse(level));
            }

            level += 1;
        }

        out.into_iter()
    }

    fn complete_chunk(&mut self, chunk: Vec<u8>) -> Vec<(Cid, Vec<u8>)> {
        let mut out = self.leaf(chunk);

        let mut level = 0;
        while level < self.levels.len() && self.levels[level].len() == self.fanout {
            out.push(self.collapse(level));
            level += 1;
        }

        out
    }

    /// Produces a raw leaf block for the chunk and records it at level zero.
    fn leaf(&mut self, chunk: Vec<u8>) -> Vec<(Cid, Vec<u8>)> {
        let cid = raw_cid(&chunk);
        let len = chunk.len() as u64;

        self.push_link(
            0,
            Link {
                cid: cid.clone(),
                total_size: len,
                file_size: len,
            },
        );

        vec![(cid, chunk)]
    }

    /// Drains a full (or finishing) level into a single file node linked from the level above.
    fn collapse(&mut self, level: usize) -> (Cid, Vec<u8>) {
        let links = std::mem::replace(&mut self.levels[level], Vec::new());

        debug_assert!(!links.is_empty());

        let file_size = links.iter().map(|l| l.file_size).sum::<u64>();
        let nested_size = links.iter().map(|l| l.total_size).sum::<u64>();

        let node = FlatUnixFs {
            links: links
                .iter()
                .map(|l| PBLink {
                    Hash: Some(Cow::Owned(l.cid.to_bytes())),
                    Name: Some(Cow::Borrowed("")),
                    Tsize: Some(l.total_size),
                })
                .collect(),
            data: UnixFs {
                Type: UnixFsType::File,
                filesize: Some(file_size),
                blocksizes: links.iter().map(|l| l.file_size).collect(),
                ..Default::default()
            },
        };

        let mut block = Vec::new();
        node.serialize(&mut block)
            .expect("writing to a Vec never fails");

        let cid = dag_pb_cid(&block);

        self.push_link(
            level + 1,
            Link {
                cid: cid.clone(),
                total_size: block.len() as u64 + nested_size,
                file_size,
            },
        );

        (cid, block)
    }

    fn push_link(&mut self, level: usize, link: Link) {
        while self.levels.len() <= level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push(link);
    }
}
