use crate::repo::BlockStore;
use crate::{Error, Result};
use cid::Cid;
use futures::stream::{FuturesUnordered, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// Identifiers per package; a package never groups more than this many blocks.
pub const PACKAGE_CAPACITY: usize = 100;

/// How many block fetches the reachability walk keeps in flight.
const WALK_CONCURRENCY: usize = 16;

/// A verification manifest over a bounded run of block identifiers.
///
/// Identifiers are in lexicographic order of their text encodings and the hash is the SHA-256 of
/// those encodings concatenated. Given the full package list of an import, a holder of the blocks
/// can verify set completeness in bounded-size batches.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub cids: Vec<Cid>,
    pub hash: [u8; 32],
}

impl Package {
    fn over(cids: Vec<Cid>) -> Package {
        let mut hasher = Sha256::new();
        for cid in &cids {
            hasher.update(cid.to_string().as_bytes());
        }
        Package {
            cids,
            hash: hasher.finalize().into(),
        }
    }

    /// The manifest hash in lowercase hex.
    pub fn hash_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in &self.hash {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

/// Collects every distinct identifier reachable from `root` and groups them into packages.
///
/// The walk fetches blocks concurrently; ordering is established afterwards by an explicit sort
/// of the text encodings, never by discovery order.
pub(crate) async fn assemble(
    store: &BlockStore,
    root: &Cid,
    cancel: &CancellationToken,
) -> Result<Vec<Package>> {
    let mut seen = HashSet::new();
    seen.insert(root.clone());

    let mut queue = vec![root.clone()];
    let mut in_flight = FuturesUnordered::new();

    loop {
        while in_flight.len() < WALK_CONCURRENCY {
            match queue.pop() {
                Some(cid) => {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let store = store.clone();
                    let cancel = cancel.clone();
                    in_flight.push(async move {
                        let block = store.get(&cid, &cancel).await?;
                        if block.cid.codec() != depot_unixfs::DAG_PB {
                            return Ok((cid, Vec::new()));
                        }
                        let links = depot_unixfs::block_links(&block.data)
                            .map_err(|source| Error::FileWalk {
                                cid: cid.clone(),
                                source,
                            })?;
                        Ok::<_, Error>((cid, links))
                    });
                }
                None => break,
            }
        }

        match in_flight.next().await {
            Some(result) => {
                let (_, links) = result?;
                for link in links {
                    if seen.insert(link.clone()) {
                        queue.push(link);
                    }
                }
            }
            None => break,
        }
    }

    let mut ordered = seen
        .into_iter()
        .map(|cid| (cid.to_string(), cid))
        .collect::<Vec<_>>();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    let packages = ordered
        .chunks(PACKAGE_CAPACITY)
        .map(|run| Package::over(run.iter().map(|(_, cid)| cid.clone()).collect()))
        .collect();

    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_over_sorted_text_encodings() {
        let a = crate::repo::BlockStore::cid_for(b"a").unwrap();
        let b = crate::repo::BlockStore::cid_for(b"b").unwrap();

        let mut sorted = vec![a.to_string(), b.to_string()];
        sorted.sort();

        let mut hasher = Sha256::new();
        hasher.update(sorted[0].as_bytes());
        hasher.update(sorted[1].as_bytes());
        let expected: [u8; 32] = hasher.finalize().into();

        let mut ordered = vec![(a.to_string(), a.clone()), (b.to_string(), b.clone())];
        ordered.sort_by(|x, y| x.0.cmp(&y.0));
        let package = Package::over(ordered.into_iter().map(|(_, cid)| cid).collect());

        assert_eq!(package.hash, expected);
        assert_eq!(package.hash_hex().len(), 64);
    }
}
