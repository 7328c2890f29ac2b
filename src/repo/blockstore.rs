use crate::repo::datastore::Datastore;
use crate::{Error, Result};
use bytes::Bytes;
use cid::Cid;
use futures::stream::{FuturesUnordered, StreamExt};
use multihash::Multihash;
use sha2::{Digest, Sha256};
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The hard ceiling for a single block.
pub const MAX_BLOCK_SIZE: usize = 128 * 1024 * 1024;

/// Concurrent lookups kept in flight by [`BlockStore::has_all`].
const MAX_CONCURRENT_LOOKUPS: usize = 100;

const GET_ATTEMPTS: u32 = 3;
const GET_BACKOFF_START: Duration = Duration::from_millis(50);

const SHA2_256: u64 = 0x12;

/// An addressed block: the bytes and the identifier they hash to.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

/// Content-addressed block storage over a [`Datastore`].
///
/// The datastore handle is set at construction and never reassigned; clones share it and need no
/// further synchronization.
#[derive(Clone)]
pub struct BlockStore {
    data: Arc<dyn Datastore>,
}

impl BlockStore {
    pub fn new(data: Arc<dyn Datastore>) -> Self {
        BlockStore { data }
    }

    fn key(cid: &Cid) -> String {
        format!(
            "/blocks/{}",
            multibase::Base::Base32Upper.encode(cid.to_bytes())
        )
    }

    /// Computes the identifier `put` would assign to these bytes: CIDv1, dag-pb, sha2-256.
    pub fn cid_for(data: &[u8]) -> Result<Cid> {
        let digest = Sha256::digest(data);
        let multihash = Multihash::wrap(SHA2_256, &digest)
            .map_err(|source| Error::HashFailure { source })?;
        Ok(Cid::new_v1(depot_unixfs::DAG_PB, multihash))
    }

    fn check_size(data: &[u8]) -> Result<()> {
        if data.len() > MAX_BLOCK_SIZE {
            return Err(Error::BlockTooLarge {
                size: data.len(),
                limit: MAX_BLOCK_SIZE,
            });
        }
        Ok(())
    }

    /// Stores the bytes under their computed identifier.
    pub async fn put(&self, data: Bytes) -> Result<Cid> {
        Self::check_size(&data)?;
        let cid = Self::cid_for(&data)?;
        self.data.put(&Self::key(&cid), data).await?;
        tracing::trace!(cid = %cid, "stored block");
        Ok(cid)
    }

    /// Stores the bytes under a caller-supplied identifier.
    ///
    /// The digest is not re-verified against the bytes: the caller owns that the identifier was
    /// computed over exactly this payload. Size limits still apply.
    pub async fn put_with_cid(&self, cid: &Cid, data: Bytes) -> Result<()> {
        Self::check_size(&data)?;
        self.data.put(&Self::key(cid), data).await
    }

    /// Stores many payloads through one datastore batch, returning their identifiers in input
    /// order. Validation happens for every element before anything is committed.
    pub async fn put_many(
        &self,
        payloads: Vec<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Cid>> {
        let mut cids = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            Self::check_size(payload)?;
            cids.push(Self::cid_for(payload)?);
        }

        let mut batch = self.data.batch();
        for (cid, payload) in cids.iter().zip(payloads) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            batch.put(Self::key(cid), payload);
        }
        batch.commit().await?;

        Ok(cids)
    }

    /// Batched sibling of [`BlockStore::put_with_cid`] for callers which computed the
    /// identifiers themselves.
    pub async fn put_many_blocks(
        &self,
        blocks: Vec<Block>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for block in &blocks {
            Self::check_size(&block.data)?;
        }

        let count = blocks.len();
        let mut batch = self.data.batch();
        for block in blocks {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            batch.put(Self::key(&block.cid), block.data);
        }
        batch.commit().await?;

        tracing::trace!(count, "committed block batch");
        Ok(())
    }

    pub async fn has(&self, cid: &Cid) -> Result<bool> {
        self.data.has(&Self::key(cid)).await
    }

    /// Checks that every identifier exists, with at most 100 lookups in flight.
    ///
    /// Cancellation stops further dispatch but every lookup already in flight is completed, so
    /// the observed results stay consistent. A panicking lookup is recovered into
    /// [`Error::WorkerPanic`] naming the identifier it was checking.
    pub async fn has_all(&self, cids: &[Cid], cancel: &CancellationToken) -> Result<bool> {
        let mut queued = cids.iter().cloned();
        let mut exhausted = false;
        let mut in_flight = FuturesUnordered::new();
        let mut all = true;
        let mut failure: Option<Error> = None;

        loop {
            while failure.is_none()
                && !exhausted
                && !cancel.is_cancelled()
                && in_flight.len() < MAX_CONCURRENT_LOOKUPS
            {
                match queued.next() {
                    Some(cid) => {
                        let store = self.clone();
                        in_flight.push(async move {
                            let checked = cid.clone();
                            let handle = tokio::spawn(async move { store.has(&cid).await });
                            match handle.await {
                                Ok(result) => result.map(|found| (checked, found)),
                                Err(join) if join.is_panic() => Err(Error::WorkerPanic {
                                    context: format!("checking existence of {}", checked),
                                }),
                                Err(_) => Err(Error::Cancelled),
                            }
                        });
                    }
                    None => exhausted = true,
                }
            }

            match in_flight.next().await {
                Some(Ok((cid, found))) => {
                    if !found {
                        tracing::debug!(cid = %cid, "block missing");
                        all = false;
                    }
                }
                Some(Err(e)) => {
                    // dispatched lookups are still drained before surfacing
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                None => break,
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if !exhausted && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(all)
    }

    /// Retrieves a block, retrying a miss behind an exponential backoff of 50, 100 and 200 ms.
    /// Datastore failures are surfaced immediately; only not-found is retried.
    pub async fn get(&self, cid: &Cid, cancel: &CancellationToken) -> Result<Block> {
        let key = Self::key(cid);
        let mut backoff = GET_BACKOFF_START;

        for attempt in 0..GET_ATTEMPTS {
            match self.data.get(&key).await? {
                Some(data) => {
                    return Ok(Block {
                        cid: cid.clone(),
                        data,
                    });
                }
                None => {
                    tracing::trace!(cid = %cid, attempt, "block miss");
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        Err(Error::BlockNotFound { cid: cid.clone() })
    }

    /// Removes a block; removing an absent block succeeds.
    pub async fn delete(&self, cid: &Cid) -> Result<()> {
        self.data.delete(&Self::key(cid)).await
    }
}

/// Parses the text form of an identifier, mapping failures to [`Error::CidInvalid`].
pub fn parse_cid(text: &str) -> Result<Cid> {
    Cid::try_from(text).map_err(|source| Error::CidInvalid {
        value: text.to_string(),
        source,
    })
}
