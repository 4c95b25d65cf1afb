use bytes::Bytes;
use std::sync::Arc;

mod memory;
pub use memory::{MemoryKvBackend, MemoryObjectBackend};

mod posix;
pub use posix::PosixObjectBackend;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object {namespace}/{name} was not found")]
    NotFound { namespace: String, name: String },
    #[error("object {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Modification time (microseconds since the Unix epoch) and byte size
/// of a stored object.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectStatus {
    pub modified: i64,
    pub size: u64,
}

/// How strongly a committed key-value write batch must be persisted:
/// Buffered is satisfied once the store has accepted the writes, while
/// Durable requires them to be flushed to stable storage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitMode {
    Buffered,
    Durable,
}

/// Capability set of a byte-addressable object store.
///
/// Objects live under a two-level (namespace, name) identity. `create`
/// fails if the object already exists, everything else fails if it does
/// not. Implementations must be safe for concurrent use across disjoint
/// namespaces.
#[async_trait::async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn create(&self, namespace: &str, name: &str) -> Result<Box<dyn BackendObject>>;
    async fn open(&self, namespace: &str, name: &str) -> Result<Box<dyn BackendObject>>;
}

/// An open object. Dropping the handle closes it; `delete` consumes the
/// stored object itself.
#[async_trait::async_trait]
pub trait BackendObject: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`, returning how many were
    /// available. A short count means the read crossed the object's end.
    async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    /// Write all of `data` at `offset`. Writing past the current end
    /// extends the object; any hole in between reads back as zeroes.
    async fn write(&self, data: Bytes, offset: u64) -> Result<usize>;
    async fn status(&self) -> Result<ObjectStatus>;
    /// Flush buffered writes to stable storage.
    async fn sync(&self) -> Result<()>;
    async fn delete(&self) -> Result<()>;
}

/// Capability set of a key-value store holding opaque binary documents.
#[async_trait::async_trait]
pub trait KvBackend: Send + Sync {
    /// Begin a write batch against `namespace`. Staged puts and deletes
    /// are applied on commit, atomically if the store supports it and
    /// otherwise best-effort in staging order.
    async fn write_batch(&self, namespace: &str, mode: CommitMode) -> Result<Box<dyn KvWriteBatch>>;
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>>;
    /// Iterate `namespace` in key order, restricted to keys starting
    /// with `prefix` when one is given.
    async fn scan(&self, namespace: &str, prefix: Option<&str>) -> Result<KvScan>;
}

#[async_trait::async_trait]
pub trait KvWriteBatch: Send {
    fn put(&mut self, key: &str, value: Bytes);
    fn delete(&mut self, key: &str);
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Snapshot iterator over scanned key-value entries.
pub struct KvScan {
    entries: std::vec::IntoIter<(String, Bytes)>,
}

impl KvScan {
    pub fn new(entries: Vec<(String, Bytes)>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }
}

impl Iterator for KvScan {
    type Item = (String, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

/// Resolve a configured object backend by name.
pub fn object_backend(name: &str, path: &str) -> Result<Arc<dyn ObjectBackend>> {
    match name {
        "memory" => Ok(Arc::new(MemoryObjectBackend::new())),
        "posix" => Ok(Arc::new(PosixObjectBackend::new(path)?)),
        other => Err(Error::UnknownBackend(other.to_string())),
    }
}

/// Resolve a configured key-value backend by name.
pub fn kv_backend(name: &str, _path: &str) -> Result<Arc<dyn KvBackend>> {
    match name {
        "memory" => Ok(Arc::new(MemoryKvBackend::new())),
        other => Err(Error::UnknownBackend(other.to_string())),
    }
}

pub(crate) fn unix_micros(time: std::time::SystemTime) -> i64 {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_micros() as i64,
        Err(_) => 0,
    }
}
