use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Durable key/value storage consumed by the repository.
///
/// Keys are `/`-separated UTF-8 strings. Absence is reported as `Ok(None)` from
/// [`Datastore::get`], which is the not-found sentinel; `Err` always means the store itself
/// failed. `close` must tolerate repeated calls.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn has(&self, key: &str) -> Result<bool>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Starts an atomic batch of writes. Nothing is visible before `commit`.
    fn batch(&self) -> Box<dyn Batch>;

    async fn disk_usage(&self) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

/// Accumulates writes for an atomic commit.
#[async_trait]
pub trait Batch: Send {
    fn put(&mut self, key: String, value: Bytes);

    fn delete(&mut self, key: String);

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[derive(Debug)]
pub(crate) enum BatchOp {
    Put(String, Bytes),
    Delete(String),
}

/// In-memory datastore, mostly useful for tests.
#[derive(Default, Clone)]
pub struct MemDatastore {
    inner: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        self.inner.lock().expect("mem datastore lock never poisons")
    }
}

#[async_trait]
impl Datastore for MemDatastore {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.lock().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn batch(&self) -> Box<dyn Batch> {
        Box::new(MemBatch {
            ops: Vec::new(),
            target: self.clone(),
        })
    }

    async fn disk_usage(&self) -> Result<u64> {
        Ok(self.lock().values().map(|v| v.len() as u64).sum())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemBatch {
    ops: Vec<BatchOp>,
    target: MemDatastore,
}

#[async_trait]
impl Batch for MemBatch {
    fn put(&mut self, key: String, value: Bytes) {
        self.ops.push(BatchOp::Put(key, value));
    }

    fn delete(&mut self, key: String) {
        self.ops.push(BatchOp::Delete(key));
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        // single lock acquisition makes the batch visible at once
        let mut map = self.target.lock();
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_and_has_after_put() {
        let ds = MemDatastore::new();
        ds.put("/a", Bytes::from_static(b"1")).await.unwrap();

        assert_eq!(ds.get("/a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert!(ds.has("/a").await.unwrap());
        assert_eq!(ds.get("/missing").await.unwrap(), None);
        assert!(!ds.has("/missing").await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let ds = MemDatastore::new();
        ds.put("/a", Bytes::from_static(b"1")).await.unwrap();
        ds.delete("/a").await.unwrap();
        ds.delete("/a").await.unwrap();
        assert!(!ds.has("/a").await.unwrap());
    }

    #[tokio::test]
    async fn batch_is_not_visible_before_commit() {
        let ds = MemDatastore::new();
        let mut batch = ds.batch();
        batch.put("/a".into(), Bytes::from_static(b"1"));
        batch.put("/b".into(), Bytes::from_static(b"2"));

        assert!(!ds.has("/a").await.unwrap());
        batch.commit().await.unwrap();
        assert!(ds.has("/a").await.unwrap());
        assert!(ds.has("/b").await.unwrap());
    }
}
