use crate::repo::datastore::{Batch, Datastore};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Routes keys to child datastores by longest matching mountpoint prefix.
pub struct MountDatastore {
    /// Sorted by mountpoint length, longest first, so resolution is a linear scan.
    mounts: Vec<Mount>,
}

struct Mount {
    point: String,
    store: Arc<dyn Datastore>,
}

impl MountDatastore {
    pub fn new(mounts: Vec<(String, Arc<dyn Datastore>)>) -> Self {
        let mut mounts = mounts
            .into_iter()
            .map(|(point, store)| Mount { point, store })
            .collect::<Vec<_>>();
        mounts.sort_by(|a, b| b.point.len().cmp(&a.point.len()));
        MountDatastore { mounts }
    }

    fn resolve<'a>(&'a self, key: &'a str) -> Result<(&'a Mount, &'a str)> {
        for mount in &self.mounts {
            let rest = if mount.point == "/" {
                Some(key)
            } else {
                key.strip_prefix(mount.point.as_str())
            };

            // a prefix match only counts on a component boundary
            if let Some(rest) = rest {
                if rest.is_empty() || rest.starts_with('/') {
                    return Ok((mount, rest.trim_start_matches('/')));
                }
            }
        }

        Err(Error::StorageFailure {
            source: anyhow::anyhow!("no mount covers key {:?}", key),
        })
    }
}

#[async_trait]
impl Datastore for MountDatastore {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let (mount, rest) = self.resolve(key)?;
        mount.store.put(rest, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let (mount, rest) = self.resolve(key)?;
        mount.store.get(rest).await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let (mount, rest) = self.resolve(key)?;
        mount.store.has(rest).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let (mount, rest) = self.resolve(key)?;
        mount.store.delete(rest).await
    }

    fn batch(&self) -> Box<dyn Batch> {
        Box::new(MountBatch {
            children: self
                .mounts
                .iter()
                .map(|m| (m.point.clone(), m.store.batch()))
                .collect(),
        })
    }

    async fn disk_usage(&self) -> Result<u64> {
        let mut total = 0;
        for mount in &self.mounts {
            total += mount.store.disk_usage().await?;
        }
        Ok(total)
    }

    async fn close(&self) -> Result<()> {
        let mut first_failure = None;
        for mount in &self.mounts {
            if let Err(e) = mount.store.close().await {
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A batch over a mount fans writes out to per-child batches; each child batch is atomic on its
/// own and they commit in mount order.
struct MountBatch {
    children: Vec<(String, Box<dyn Batch>)>,
}

impl MountBatch {
    fn child_for(&mut self, key: &str) -> Option<(usize, String)> {
        for (index, (point, _)) in self.children.iter().enumerate() {
            let rest = if point == "/" {
                Some(key)
            } else {
                key.strip_prefix(point.as_str())
            };
            if let Some(rest) = rest {
                if rest.is_empty() || rest.starts_with('/') {
                    return Some((index, rest.trim_start_matches('/').to_string()));
                }
            }
        }
        None
    }
}

#[async_trait]
impl Batch for MountBatch {
    fn put(&mut self, key: String, value: Bytes) {
        if let Some((index, rest)) = self.child_for(&key) {
            self.children[index].1.put(rest, value);
        }
    }

    fn delete(&mut self, key: String) {
        if let Some((index, rest)) = self.child_for(&key) {
            self.children[index].1.delete(rest);
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        for (_, child) in self.children {
            child.commit().await?;
        }
        Ok(())
    }
}

/// The on-disk layout declaration written to `datastore_spec`.
///
/// The serialized form must stay byte-for-byte stable across releases: an existing repository is
/// only opened when its stored spec matches this one exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DatastoreSpec {
    pub mounts: Vec<MountSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MountSpec {
    pub mountpoint: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "shardFunc", skip_serializing_if = "Option::is_none")]
    pub shard_func: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<bool>,
}

impl DatastoreSpec {
    pub(crate) fn default_layout() -> Self {
        DatastoreSpec {
            mounts: vec![
                MountSpec {
                    mountpoint: "/blocks".to_string(),
                    path: "blocks".to_string(),
                    kind: "flatfs".to_string(),
                    shard_func: Some("/repo/flatfs/shard/v1/next-to-last/2".to_string()),
                    sync: Some(true),
                },
                MountSpec {
                    mountpoint: "/".to_string(),
                    path: "datastore".to_string(),
                    kind: "sled".to_string(),
                    shard_func: None,
                    sync: None,
                },
            ],
        }
    }

    /// The canonical UTF-8 JSON form used both for writing and the byte-for-byte comparison.
    pub(crate) fn canonical(&self) -> String {
        serde_json::to_string(self).expect("the spec model always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::datastore::MemDatastore;

    fn mounted() -> (MountDatastore, MemDatastore, MemDatastore) {
        let blocks = MemDatastore::new();
        let root = MemDatastore::new();
        let mount = MountDatastore::new(vec![
            ("/blocks".to_string(), Arc::new(blocks.clone()) as Arc<dyn Datastore>),
            ("/".to_string(), Arc::new(root.clone()) as Arc<dyn Datastore>),
        ]);
        (mount, blocks, root)
    }

    #[tokio::test]
    async fn routes_by_longest_prefix() {
        let (mount, blocks, root) = mounted();

        mount.put("/blocks/KEY", Bytes::from_static(b"b")).await.unwrap();
        mount.put("/meta", Bytes::from_static(b"m")).await.unwrap();

        assert!(blocks.has("KEY").await.unwrap());
        assert!(root.has("meta").await.unwrap());
        assert!(mount.has("/blocks/KEY").await.unwrap());
        assert_eq!(
            mount.get("/meta").await.unwrap(),
            Some(Bytes::from_static(b"m"))
        );
    }

    #[tokio::test]
    async fn batches_fan_out() {
        let (mount, blocks, root) = mounted();

        let mut batch = mount.batch();
        batch.put("/blocks/A".into(), Bytes::from_static(b"1"));
        batch.put("/other".into(), Bytes::from_static(b"2"));
        batch.commit().await.unwrap();

        assert!(blocks.has("A").await.unwrap());
        assert!(root.has("other").await.unwrap());
    }

    #[test]
    fn spec_serialization_is_stable() {
        let spec = DatastoreSpec::default_layout();
        let expected = concat!(
            r#"{"mounts":[{"mountpoint":"/blocks","path":"blocks","type":"flatfs","#,
            r#""shardFunc":"/repo/flatfs/shard/v1/next-to-last/2","sync":true},"#,
            r#"{"mountpoint":"/","path":"datastore","type":"sled"}]}"#
        );
        assert_eq!(spec.canonical(), expected);

        let parsed: DatastoreSpec = serde_json::from_str(&spec.canonical()).unwrap();
        assert_eq!(parsed, spec);
    }
}
