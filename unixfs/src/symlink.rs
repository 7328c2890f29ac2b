use crate::dag_pb_cid;
use crate::pb::{FlatUnixFs, UnixFs, UnixFsType};
use cid::Cid;
use std::borrow::Cow;

/// Serializes a symlink node pointing at `target`.
///
/// The target is not validated here; consumers decide what targets they accept before creating
/// anything on disk.
pub fn serialize_symlink_block(target: &str) -> (Cid, Vec<u8>) {
    let node = FlatUnixFs {
        links: Vec::new(),
        data: UnixFs {
            Type: UnixFsType::Symlink,
            Data: Some(Cow::Borrowed(target.as_bytes())),
            ..Default::default()
        },
    };

    let mut block = Vec::new();
    node.serialize(&mut block)
        .expect("writing to a Vec never fails");

    let cid = dag_pb_cid(&block);
    (cid, block)
}

#[cfg(test)]
mod tests {
    use super::serialize_symlink_block;

    #[test]
    fn deterministic() {
        let (a, block_a) = serialize_symlink_block("target");
        let (b, block_b) = serialize_symlink_block("target");
        assert_eq!(a, b);
        assert_eq!(block_a, block_b);

        let (c, _) = serialize_symlink_block("other");
        assert_ne!(a, c);
    }
}
