//! UnixFS tree support for the depot repository.
//!
//! Everything in this crate is sans-I/O: the adder and the tree builder hand produced blocks back
//! to the caller as `(Cid, bytes)` pairs, and the readers and visits are fed blocks the caller
//! fetched. Persistence, ordering of writes and any concurrency live with the caller.

pub mod dir;
pub mod file;
pub mod pb;
pub mod symlink;

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};

/// Multicodec for dag-pb encoded blocks.
pub const DAG_PB: u64 = 0x70;

/// Multicodec for raw blocks, used for file content leaves.
pub const RAW: u64 = 0x55;

const SHA2_256: u64 = 0x12;

/// Computes the identifier of a dag-pb encoded block: CIDv1, dag-pb, sha2-256.
pub fn dag_pb_cid(block: &[u8]) -> Cid {
    Cid::new_v1(DAG_PB, sha256_multihash(block))
}

/// Computes the identifier of a raw leaf block: CIDv1, raw, sha2-256.
pub fn raw_cid(block: &[u8]) -> Cid {
    Cid::new_v1(RAW, sha256_multihash(block))
}

fn sha256_multihash(block: &[u8]) -> Multihash {
    Multihash::wrap(SHA2_256, &Sha256::digest(block))
        .expect("a sha2-256 digest always fits a multihash")
}

/// Collects the links of a dag-pb encoded block without interpreting its data field.
///
/// Useful for graph walks which only need reachability, like collecting the block set behind a
/// root. Raw leaves have no links; callers skip them by codec.
pub fn block_links(block: &[u8]) -> Result<Vec<Cid>, file::FileReadFailed> {
    use quick_protobuf::{BytesReader, MessageRead};
    use std::borrow::Cow;
    use std::convert::TryFrom;

    let mut reader = BytesReader::from_bytes(block);
    let node = pb::PBNode::from_reader(&mut reader, block)
        .map_err(|e| file::FileReadFailed::Read(pb::UnixFsReadFailed::InvalidDagPb(e)))?;

    let mut links = Vec::with_capacity(node.Links.len());
    for (nth, link) in node.Links.into_iter().enumerate() {
        let hash = link.Hash.as_deref().unwrap_or_default();
        let cid = Cid::try_from(hash).map_err(|cause| file::FileReadFailed::LinkInvalidCid {
            nth,
            hash: hash.to_vec(),
            name: match link.Name.as_deref() {
                Some(name) => Cow::Owned(name.to_string()),
                None => Cow::Borrowed(""),
            },
            cause,
        })?;
        links.push(cid);
    }

    Ok(links)
}
