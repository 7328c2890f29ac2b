use crate::dag_pb_cid;
use crate::pb::{FlatUnixFs, PBLink, UnixFs, UnixFsType};
use cid::Cid;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// A link to an already persisted subtree: the leaf payloads of the tree being built.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub cid: Cid,
    /// Cumulative encoded size of the subtree behind `cid`.
    pub total_size: u64,
}

/// In-memory buffering directory tree builder.
///
/// Paths accumulate leaves (files, symlinks) and nested directories; [`TreeBuilder::flush`]
/// renders every directory whose subtree changed into a dag-pb block and caches its identifier.
/// Children are always rendered in lexicographic name order, so the root identifier depends only
/// on the logical tree, never on insertion order.
///
/// Directories are kept in an arena indexed by integer ids; parent links are ids, which keeps the
/// tree walkable in both directions without reference cycles.
pub struct TreeBuilder {
    arena: Vec<DirNode>,
}

struct DirNode {
    parent: Option<usize>,
    entries: BTreeMap<String, Entry>,
    /// The rendered form of this directory; cleared whenever the subtree below it changes.
    cached: Option<Leaf>,
}

enum Entry {
    Directory(usize),
    Leaf(Leaf),
}

impl Default for TreeBuilder {
    fn default() -> Self {
        TreeBuilder {
            arena: vec![DirNode {
                parent: None,
                entries: BTreeMap::new(),
                cached: None,
            }],
        }
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the directory at `path`, creating any missing parents. Existing directories are
    /// left alone.
    pub fn mkdir(&mut self, path: &[&str]) -> Result<(), TreeBuildingFailed> {
        self.ensure_directory(path).map(|_| ())
    }

    /// Places a leaf at `path`, creating any missing parent directories. The last component is
    /// the entry name.
    pub fn put_leaf(
        &mut self,
        path: &[&str],
        cid: Cid,
        total_size: u64,
    ) -> Result<(), TreeBuildingFailed> {
        let (name, parents) = match path.split_last() {
            Some(split) => split,
            None => return Err(TreeBuildingFailed::EmptyPath),
        };

        let dir = self.ensure_directory(parents)?;

        if self.arena[dir].entries.contains_key(*name) {
            return Err(TreeBuildingFailed::DuplicatePath(path.join("/")));
        }

        self.arena[dir]
            .entries
            .insert((*name).to_string(), Entry::Leaf(Leaf { cid, total_size }));
        self.invalidate(dir);

        Ok(())
    }

    /// The rendered root, available after a [`TreeBuilder::flush`] with no later modifications.
    pub fn root(&self) -> Option<&Leaf> {
        self.arena[0].cached.as_ref()
    }

    /// Renders every directory whose subtree changed since the last flush, children before
    /// parents, the root last. The returned blocks are the caller's to persist; rendered buffers
    /// are not retained here.
    pub fn flush(&mut self) -> Result<Vec<(Cid, Vec<u8>)>, TreeConstructionFailed> {
        enum Visit {
            Pre(usize),
            Post(usize),
        }

        let mut out = Vec::new();
        let mut pending = vec![Visit::Pre(0)];

        while let Some(visit) = pending.pop() {
            match visit {
                Visit::Pre(id) => {
                    if self.arena[id].cached.is_some() {
                        continue;
                    }
                    pending.push(Visit::Post(id));
                    let children = self.arena[id]
                        .entries
                        .values()
                        .filter_map(|e| match e {
                            Entry::Directory(child) => Some(*child),
                            Entry::Leaf(_) => None,
                        })
                        .collect::<Vec<_>>();
                    pending.extend(children.into_iter().map(Visit::Pre));
                }
                Visit::Post(id) => {
                    let (cid, block, total_size) = self.render_directory(id)?;
                    self.arena[id].cached = Some(Leaf {
                        cid: cid.clone(),
                        total_size,
                    });
                    out.push((cid, block));
                }
            }
        }

        Ok(out)
    }

    fn ensure_directory(&mut self, path: &[&str]) -> Result<usize, TreeBuildingFailed> {
        let mut current = 0;

        for (depth, component) in path.iter().enumerate() {
            let existing = match self.arena[current].entries.get(*component) {
                Some(Entry::Directory(id)) => Some(*id),
                Some(Entry::Leaf(_)) => {
                    return Err(TreeBuildingFailed::LeafAsParent(
                        path[..=depth].join("/"),
                    ));
                }
                None => None,
            };

            current = match existing {
                Some(id) => id,
                None => {
                    let id = self.arena.len();
                    self.arena.push(DirNode {
                        parent: Some(current),
                        entries: BTreeMap::new(),
                        cached: None,
                    });
                    self.arena[current]
                        .entries
                        .insert((*component).to_string(), Entry::Directory(id));
                    self.invalidate(current);
                    id
                }
            };
        }

        Ok(current)
    }

    /// Clears cached renderings from `id` up to the root.
    fn invalidate(&mut self, id: usize) {
        let mut current = Some(id);
        while let Some(id) = current {
            self.arena[id].cached = None;
            current = self.arena[id].parent;
        }
    }

    fn render_directory(
        &self,
        id: usize,
    ) -> Result<(Cid, Vec<u8>, u64), TreeConstructionFailed> {
        let node = &self.arena[id];

        let mut links = Vec::with_capacity(node.entries.len());
        let mut nested_size = 0u64;

        for (name, entry) in &node.entries {
            let leaf: &Leaf = match entry {
                Entry::Leaf(leaf) => leaf,
                Entry::Directory(child) => self.arena[*child]
                    .cached
                    .as_ref()
                    .expect("children are rendered before their parents"),
            };

            nested_size += leaf.total_size;
            links.push(PBLink {
                Hash: Some(Cow::Owned(leaf.cid.to_bytes())),
                Name: Some(Cow::Borrowed(name.as_str())),
                Tsize: Some(leaf.total_size),
            });
        }

        let rendered = FlatUnixFs {
            links,
            data: UnixFs {
                Type: UnixFsType::Directory,
                ..Default::default()
            },
        };

        let mut block = Vec::new();
        rendered
            .serialize(&mut block)
            .map_err(TreeConstructionFailed::Protobuf)?;

        let cid = dag_pb_cid(&block);
        let total_size = block.len() as u64 + nested_size;

        Ok((cid, block, total_size))
    }
}

/// Errors from shaping the tree, before any rendering happens.
#[derive(Debug, PartialEq)]
pub enum TreeBuildingFailed {
    EmptyPath,
    /// The path already holds an entry.
    DuplicatePath(String),
    /// An intermediate component of the path is a leaf, not a directory.
    LeafAsParent(String),
}

impl fmt::Display for TreeBuildingFailed {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TreeBuildingFailed::*;

        match self {
            EmptyPath => write!(fmt, "path was empty"),
            DuplicatePath(path) => write!(fmt, "path exists already: {:?}", path),
            LeafAsParent(path) => {
                write!(fmt, "path component is a file, not a directory: {:?}", path)
            }
        }
    }
}

impl std::error::Error for TreeBuildingFailed {}

/// Errors from rendering directory blocks.
#[derive(Debug)]
pub enum TreeConstructionFailed {
    Protobuf(quick_protobuf::Error),
}

impl fmt::Display for TreeConstructionFailed {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeConstructionFailed::Protobuf(e) => write!(fmt, "serialization failed: {}", e),
        }
    }
}

impl std::error::Error for TreeConstructionFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TreeConstructionFailed::Protobuf(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TreeBuilder, TreeBuildingFailed};
    use crate::raw_cid;

    #[test]
    fn root_independent_of_insertion_order() {
        let a_cid = raw_cid(b"a");
        let b_cid = raw_cid(b"b");

        let mut forward = TreeBuilder::new();
        forward.put_leaf(&["dir", "a"], a_cid.clone(), 1).unwrap();
        forward.put_leaf(&["dir", "b"], b_cid.clone(), 1).unwrap();
        forward.flush().unwrap();

        let mut reverse = TreeBuilder::new();
        reverse.put_leaf(&["dir", "b"], b_cid, 1).unwrap();
        reverse.put_leaf(&["dir", "a"], a_cid, 1).unwrap();
        reverse.flush().unwrap();

        assert_eq!(forward.root(), reverse.root());
        assert!(forward.root().is_some());
    }

    #[test]
    fn flush_renders_children_before_parents_and_root_last() {
        let mut tree = TreeBuilder::new();
        tree.put_leaf(&["a", "b", "c"], raw_cid(b"x"), 1).unwrap();

        let blocks = tree.flush().unwrap();
        // c's parent "b", then "a", then the root
        assert_eq!(blocks.len(), 3);
        assert_eq!(&blocks[2].0, &tree.root().unwrap().cid);
    }

    #[test]
    fn reflush_after_modification_changes_root() {
        let mut tree = TreeBuilder::new();
        tree.put_leaf(&["one"], raw_cid(b"1"), 1).unwrap();
        tree.flush().unwrap();
        let first = tree.root().unwrap().clone();

        tree.put_leaf(&["two"], raw_cid(b"2"), 1).unwrap();
        let blocks = tree.flush().unwrap();
        assert_eq!(blocks.len(), 1);

        let second = tree.root().unwrap().clone();
        assert_ne!(first, second);
    }

    #[test]
    fn flush_skips_clean_subtrees() {
        let mut tree = TreeBuilder::new();
        tree.put_leaf(&["left", "file"], raw_cid(b"l"), 1).unwrap();
        tree.put_leaf(&["right", "file"], raw_cid(b"r"), 1).unwrap();
        tree.flush().unwrap();

        tree.put_leaf(&["right", "other"], raw_cid(b"o"), 1).unwrap();
        let blocks = tree.flush().unwrap();

        // only "right" and the root are re-rendered
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn duplicate_leaf_is_refused() {
        let mut tree = TreeBuilder::new();
        tree.put_leaf(&["dup"], raw_cid(b"1"), 1).unwrap();
        match tree.put_leaf(&["dup"], raw_cid(b"2"), 1) {
            Err(TreeBuildingFailed::DuplicatePath(p)) => assert_eq!(p, "dup"),
            x => panic!("unexpected: {:?}", x),
        }
    }

    #[test]
    fn leaf_as_parent_is_refused() {
        let mut tree = TreeBuilder::new();
        tree.put_leaf(&["file"], raw_cid(b"1"), 1).unwrap();
        match tree.put_leaf(&["file", "child"], raw_cid(b"2"), 1) {
            Err(TreeBuildingFailed::LeafAsParent(p)) => assert_eq!(p, "file"),
            x => panic!("unexpected: {:?}", x),
        }
    }

    #[test]
    fn empty_directory_renders() {
        let mut tree = TreeBuilder::new();
        let blocks = tree.flush().unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(tree.root().is_some());
    }
}
