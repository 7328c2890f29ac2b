use crate::repo::datastore::{Batch, BatchOp, Datastore};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sharded flat-file datastore: one file per key under a two character shard directory taken from
/// the next-to-last characters of the key (`/repo/flatfs/shard/v1/next-to-last/2`).
///
/// Writes go through a sibling temporary file and a rename so that a crash can leave stale
/// temporaries around but never a torn value. With `sync` enabled the file is flushed to disk
/// before the rename.
pub struct FlatFsDatastore {
    root: PathBuf,
    sync: bool,
}

impl FlatFsDatastore {
    pub async fn open(root: impl Into<PathBuf>, sync: bool) -> Result<Arc<Self>> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::io(&root, e))?;
        Ok(Arc::new(FlatFsDatastore { root, sync }))
    }

    fn shard(key: &str) -> &str {
        let len = key.len();
        if len >= 3 {
            &key[len - 3..len - 1]
        } else {
            "_"
        }
    }

    fn data_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.join(Self::shard(key));
        path.push(key);
        path.set_extension("data");
        path
    }

    async fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let target = self.data_path(key);
        let dir = target.parent().expect("data paths always have a shard dir");

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io(dir, e))?;

        let temporary = dir.join(format!(".tmp-{}", key));

        let result = async {
            tokio::fs::write(&temporary, value).await?;
            if self.sync {
                let file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&temporary)
                    .await?;
                file.sync_all().await?;
            }
            tokio::fs::rename(&temporary, &target).await
        }
        .await;

        if let Err(e) = result {
            // the temporary might linger after a failure; it is unreachable by any key
            let _ = tokio::fs::remove_file(&temporary).await;
            return Err(Error::storage(e));
        }

        Ok(())
    }
}

#[async_trait]
impl Datastore for FlatFsDatastore {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.write_file(key, &value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.data_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(e)),
        }
    }

    async fn has(&self, key: &str) -> Result<bool> {
        match tokio::fs::metadata(self.data_path(key)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::storage(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.data_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(e)),
        }
    }

    fn batch(&self) -> Box<dyn Batch> {
        Box::new(FlatFsBatch {
            ops: Vec::new(),
            store: FlatFsDatastore {
                root: self.root.clone(),
                sync: self.sync,
            },
        })
    }

    async fn disk_usage(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::storage(e)),
            };

            while let Some(entry) = entries.next_entry().await.map_err(Error::storage)? {
                let meta = entry.metadata().await.map_err(Error::storage)?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }

        Ok(total)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Flat-file stores have no transaction to lean on; the batch applies its operations in order on
/// commit. Each individual value still lands atomically through the rename.
struct FlatFsBatch {
    ops: Vec<BatchOp>,
    store: FlatFsDatastore,
}

#[async_trait]
impl Batch for FlatFsBatch {
    fn put(&mut self, key: String, value: Bytes) {
        self.ops.push(BatchOp::Put(key, value));
    }

    fn delete(&mut self, key: String) {
        self.ops.push(BatchOp::Delete(key));
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => self.store.put(&key, value).await?,
                BatchOp::Delete(key) => self.store.delete(&key).await?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharding_uses_next_to_last_two() {
        assert_eq!(FlatFsDatastore::shard("CIQABCDEF"), "DE");
        assert_eq!(FlatFsDatastore::shard("XYZ"), "XY");
        assert_eq!(FlatFsDatastore::shard("AB"), "_");
    }

    #[tokio::test]
    async fn roundtrip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let ds = FlatFsDatastore::open(dir.path().join("blocks"), true)
            .await
            .unwrap();

        ds.put("CIQABCDEF", Bytes::from_static(b"value")).await.unwrap();

        assert_eq!(
            ds.get("CIQABCDEF").await.unwrap(),
            Some(Bytes::from_static(b"value"))
        );
        assert!(ds.has("CIQABCDEF").await.unwrap());

        let expected = dir.path().join("blocks").join("DE").join("CIQABCDEF.data");
        assert!(expected.is_file(), "missing {:?}", expected);

        assert!(ds.disk_usage().await.unwrap() >= 5);

        ds.delete("CIQABCDEF").await.unwrap();
        ds.delete("CIQABCDEF").await.unwrap();
        assert_eq!(ds.get("CIQABCDEF").await.unwrap(), None);
    }
}
