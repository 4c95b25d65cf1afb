use crate::{
    BackendObject, CommitMode, Error, KvBackend, KvScan, KvWriteBatch, ObjectBackend,
    ObjectStatus, Result,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Object storage held entirely in process memory.
/// Namespaces map to ordered name → object tables behind one RwLock.
pub struct MemoryObjectBackend {
    store: Arc<RwLock<HashMap<String, BTreeMap<String, Stored>>>>,
}

struct Stored {
    data: Vec<u8>,
    modified: i64,
}

impl MemoryObjectBackend {
    pub fn new() -> Self {
        Self {
            store: Default::default(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectBackend for MemoryObjectBackend {
    async fn create(&self, namespace: &str, name: &str) -> Result<Box<dyn BackendObject>> {
        let mut store = self.store.write().await;
        let table = store.entry(namespace.to_string()).or_default();

        if table.contains_key(name) {
            return Err(Error::AlreadyExists {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        table.insert(
            name.to_string(),
            Stored {
                data: Vec::new(),
                modified: crate::unix_micros(std::time::SystemTime::now()),
            },
        );

        Ok(Box::new(MemoryObject {
            store: self.store.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }))
    }

    async fn open(&self, namespace: &str, name: &str) -> Result<Box<dyn BackendObject>> {
        let store = self.store.read().await;

        if !store
            .get(namespace)
            .map_or(false, |table| table.contains_key(name))
        {
            return Err(Error::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        Ok(Box::new(MemoryObject {
            store: self.store.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }))
    }
}

struct MemoryObject {
    store: Arc<RwLock<HashMap<String, BTreeMap<String, Stored>>>>,
    namespace: String,
    name: String,
}

impl MemoryObject {
    fn not_found(&self) -> Error {
        Error::NotFound {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[async_trait::async_trait]
impl BackendObject for MemoryObject {
    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let store = self.store.read().await;
        let stored = store
            .get(&self.namespace)
            .and_then(|table| table.get(&self.name))
            .ok_or_else(|| self.not_found())?;

        let offset = offset.min(stored.data.len() as u64) as usize;
        let n = buf.len().min(stored.data.len() - offset);
        buf[..n].copy_from_slice(&stored.data[offset..offset + n]);
        Ok(n)
    }

    async fn write(&self, data: Bytes, offset: u64) -> Result<usize> {
        let mut store = self.store.write().await;
        let stored = store
            .get_mut(&self.namespace)
            .and_then(|table| table.get_mut(&self.name))
            .ok_or_else(|| self.not_found())?;

        let end = offset as usize + data.len();
        if stored.data.len() < end {
            // A write past the current end implicitly zero-fills the hole.
            stored.data.resize(end, 0);
        }
        stored.data[offset as usize..end].copy_from_slice(&data);
        stored.modified = crate::unix_micros(std::time::SystemTime::now());
        Ok(data.len())
    }

    async fn status(&self) -> Result<ObjectStatus> {
        let store = self.store.read().await;
        let stored = store
            .get(&self.namespace)
            .and_then(|table| table.get(&self.name))
            .ok_or_else(|| self.not_found())?;

        Ok(ObjectStatus {
            modified: stored.modified,
            size: stored.data.len() as u64,
        })
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let mut store = self.store.write().await;
        store
            .get_mut(&self.namespace)
            .and_then(|table| table.remove(&self.name))
            .ok_or_else(|| self.not_found())?;
        Ok(())
    }
}

/// Key-value storage held entirely in process memory. BTreeMap tables
/// give ordered scans; a committed write batch is applied under a single
/// lock acquisition and is therefore atomic.
pub struct MemoryKvBackend {
    store: Arc<RwLock<HashMap<String, BTreeMap<String, Bytes>>>>,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self {
            store: Default::default(),
        }
    }
}

#[async_trait::async_trait]
impl KvBackend for MemoryKvBackend {
    async fn write_batch(
        &self,
        namespace: &str,
        _mode: CommitMode,
    ) -> Result<Box<dyn KvWriteBatch>> {
        Ok(Box::new(MemoryWriteBatch {
            store: self.store.clone(),
            namespace: namespace.to_string(),
            staged: Vec::new(),
        }))
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        let store = self.store.read().await;
        Ok(store
            .get(namespace)
            .and_then(|table| table.get(key))
            .cloned())
    }

    async fn scan(&self, namespace: &str, prefix: Option<&str>) -> Result<KvScan> {
        let store = self.store.read().await;
        let Some(table) = store.get(namespace) else {
            return Ok(KvScan::new(Vec::new()));
        };

        let entries = match prefix {
            Some(prefix) => table
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            None => table
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };
        Ok(KvScan::new(entries))
    }
}

struct MemoryWriteBatch {
    store: Arc<RwLock<HashMap<String, BTreeMap<String, Bytes>>>>,
    namespace: String,
    staged: Vec<Staged>,
}

enum Staged {
    Put(String, Bytes),
    Delete(String),
}

#[async_trait::async_trait]
impl KvWriteBatch for MemoryWriteBatch {
    fn put(&mut self, key: &str, value: Bytes) {
        self.staged.push(Staged::Put(key.to_string(), value));
    }

    fn delete(&mut self, key: &str) {
        self.staged.push(Staged::Delete(key.to_string()));
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryWriteBatch {
            store,
            namespace,
            staged,
        } = *self;
        let mut store = store.write().await;
        let table = store.entry(namespace).or_default();

        for staged in staged {
            match staged {
                Staged::Put(key, value) => {
                    table.insert(key, value);
                }
                Staged::Delete(key) => {
                    table.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn object_write_read_round_trip() {
        let backend = MemoryObjectBackend::new();
        let object = backend.create("ns", "obj").await.unwrap();

        assert_eq!(object.write(Bytes::from_static(b"hello"), 0).await.unwrap(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(object.read(&mut buf, 0).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");

        let status = object.status().await.unwrap();
        assert_eq!(status.size, 5);
        assert!(status.modified > 0);
    }

    #[tokio::test]
    async fn object_write_past_end_zero_fills() {
        let backend = MemoryObjectBackend::new();
        let object = backend.create("ns", "obj").await.unwrap();

        object.write(Bytes::from_static(b"xy"), 4).await.unwrap();

        let mut buf = [1u8; 6];
        assert_eq!(object.read(&mut buf, 0).await.unwrap(), 6);
        assert_eq!(&buf, b"\0\0\0\0xy");
    }

    #[tokio::test]
    async fn object_short_read_at_end() {
        let backend = MemoryObjectBackend::new();
        let object = backend.create("ns", "obj").await.unwrap();
        object.write(Bytes::from_static(b"abc"), 0).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(object.read(&mut buf, 1).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"bc");
        assert_eq!(object.read(&mut buf, 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn object_create_existing_fails_without_truncating() {
        let backend = MemoryObjectBackend::new();
        let object = backend.create("ns", "obj").await.unwrap();
        object.write(Bytes::from_static(b"keep"), 0).await.unwrap();

        match backend.create("ns", "obj").await {
            Err(Error::AlreadyExists { .. }) => (),
            other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
        }
        assert_eq!(object.status().await.unwrap().size, 4);
    }

    #[tokio::test]
    async fn object_open_and_delete_missing_fail() {
        let backend = MemoryObjectBackend::new();
        assert!(matches!(
            backend.open("ns", "missing").await.err(),
            Some(Error::NotFound { .. })
        ));

        let object = backend.create("ns", "obj").await.unwrap();
        object.delete().await.unwrap();
        assert!(matches!(
            object.delete().await.err(),
            Some(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn kv_batch_and_scan() {
        let backend = MemoryKvBackend::new();

        let mut batch = backend
            .write_batch("ns", CommitMode::Buffered)
            .await
            .unwrap();
        batch.put("a-1", Bytes::from_static(b"1"));
        batch.put("a-2", Bytes::from_static(b"2"));
        batch.put("b-1", Bytes::from_static(b"3"));
        batch.commit().await.unwrap();

        assert_eq!(
            backend.get("ns", "a-2").await.unwrap(),
            Some(Bytes::from_static(b"2"))
        );
        assert_eq!(backend.get("ns", "zz").await.unwrap(), None);

        let keys: Vec<_> = backend
            .scan("ns", Some("a-"))
            .await
            .unwrap()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["a-1", "a-2"]);

        let all: Vec<_> = backend
            .scan("ns", None)
            .await
            .unwrap()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(all, vec!["a-1", "a-2", "b-1"]);
    }

    #[tokio::test]
    async fn kv_staged_writes_invisible_until_commit() {
        let backend = MemoryKvBackend::new();

        let mut batch = backend
            .write_batch("ns", CommitMode::Buffered)
            .await
            .unwrap();
        batch.put("k", Bytes::from_static(b"v"));
        assert_eq!(backend.get("ns", "k").await.unwrap(), None);

        batch.commit().await.unwrap();
        assert_eq!(
            backend.get("ns", "k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );

        let mut batch = backend
            .write_batch("ns", CommitMode::Buffered)
            .await
            .unwrap();
        batch.delete("k");
        batch.commit().await.unwrap();
        assert_eq!(backend.get("ns", "k").await.unwrap(), None);
    }
}
