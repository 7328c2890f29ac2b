use crate::file::FileReadFailed;
use crate::pb::{FlatUnixFs, UnixFsType};
use cid::Cid;
use std::borrow::Cow;
use std::convert::TryFrom;

pub mod builder;

/// A named link out of a directory node.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    pub cid: Cid,
    /// Cumulative encoded size of the linked subtree, as advertised by the link.
    pub total_size: u64,
}

/// Reads the entries of a directory node in link order.
///
/// The caller has already checked that `node.data.Type` is `Directory`; entry names are not
/// validated here beyond UTF-8, which the wire format guarantees.
pub fn directory_entries(node: &FlatUnixFs<'_>) -> Result<Vec<DirectoryEntry>, FileReadFailed> {
    let mut entries = Vec::with_capacity(node.links.len());

    for (nth, link) in node.links.iter().enumerate() {
        let hash = link.Hash.as_deref().unwrap_or_default();
        let cid = Cid::try_from(hash).map_err(|cause| FileReadFailed::LinkInvalidCid {
            nth,
            hash: hash.to_vec(),
            name: match link.Name.as_deref() {
                Some(name) => Cow::Owned(name.to_string()),
                None => Cow::Borrowed(""),
            },
            cause,
        })?;

        entries.push(DirectoryEntry {
            name: link.Name.as_deref().unwrap_or_default().to_string(),
            cid,
            total_size: link.Tsize.unwrap_or(0),
        });
    }

    Ok(entries)
}

/// Reads the target of a symlink node. Returns `None` when the node is not a symlink.
pub fn symlink_target<'a>(node: &'a FlatUnixFs<'a>) -> Option<&'a [u8]> {
    if node.data.Type != UnixFsType::Symlink {
        return None;
    }

    Some(node.data.Data.as_deref().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symlink::serialize_symlink_block;

    #[test]
    fn symlink_roundtrip() {
        let (_, block) = serialize_symlink_block("../sibling/file.txt");
        let parsed = FlatUnixFs::try_from(block.as_slice()).unwrap();
        assert_eq!(parsed.data.Type, UnixFsType::Symlink);
        assert_eq!(
            symlink_target(&parsed),
            Some(&b"../sibling/file.txt"[..])
        );
    }

    #[test]
    fn non_symlink_has_no_target() {
        let block = &[0x0a, 0x04, 0x08, 0x02, 0x18, 0x00];
        let parsed = FlatUnixFs::try_from(&block[..]).unwrap();
        assert_eq!(symlink_target(&parsed), None);
    }
}
