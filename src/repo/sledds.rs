use crate::repo::datastore::{Batch, Datastore};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

/// Log-structured datastore over `sled`, used for everything outside the block mount.
pub struct SledDatastore {
    db: sled::Db,
}

impl SledDatastore {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let db = sled::open(path).map_err(Error::storage)?;
        Ok(Arc::new(SledDatastore { db }))
    }
}

#[async_trait]
impl Datastore for SledDatastore {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value.as_ref())
            .map_err(Error::storage)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let value = self.db.get(key.as_bytes()).map_err(Error::storage)?;
        Ok(value.map(|ivec| Bytes::copy_from_slice(&ivec)))
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.db.contains_key(key.as_bytes()).map_err(Error::storage)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes()).map_err(Error::storage)?;
        Ok(())
    }

    fn batch(&self) -> Box<dyn Batch> {
        Box::new(SledBatch {
            batch: sled::Batch::default(),
            db: self.db.clone(),
        })
    }

    async fn disk_usage(&self) -> Result<u64> {
        self.db.size_on_disk().map_err(Error::storage)
    }

    async fn close(&self) -> Result<()> {
        self.db.flush_async().await.map_err(Error::storage)?;
        Ok(())
    }
}

struct SledBatch {
    batch: sled::Batch,
    db: sled::Db,
}

#[async_trait]
impl Batch for SledBatch {
    fn put(&mut self, key: String, value: Bytes) {
        self.batch.insert(key.as_bytes(), value.as_ref());
    }

    fn delete(&mut self, key: String) {
        self.batch.remove(key.as_bytes());
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.db.apply_batch(self.batch).map_err(Error::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ds = SledDatastore::open(&dir.path().join("datastore")).unwrap();

        ds.put("/spec", Bytes::from_static(b"layout")).await.unwrap();
        assert_eq!(
            ds.get("/spec").await.unwrap(),
            Some(Bytes::from_static(b"layout"))
        );

        let mut batch = ds.batch();
        batch.put("/a".into(), Bytes::from_static(b"1"));
        batch.delete("/spec".into());
        batch.commit().await.unwrap();

        assert!(ds.has("/a").await.unwrap());
        assert!(!ds.has("/spec").await.unwrap());

        ds.close().await.unwrap();
        ds.close().await.unwrap();
    }
}
