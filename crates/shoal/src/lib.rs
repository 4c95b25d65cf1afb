pub mod batch;
pub use batch::Batch;

mod cache;

pub mod config;
pub use config::{Component, Configuration};

pub mod distribution;

mod kv;
pub use kv::{Kv, KvIterator, ValueSlot};

pub mod message;
pub use message::{Message, Opcode};

mod object;
pub use object::{ByteCount, Object, ReadSlot, StatusSlot};

pub mod pool;
pub use pool::{ConnectionPool, PooledConnection};

mod runtime;
pub use runtime::Runtime;

pub mod semantics;
pub use semantics::Semantics;

mod worker;
pub use worker::{TaskHandle, WorkerPool};

pub use shoal_backend::ObjectStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Backend(#[from] shoal_backend::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// A frame carried an opcode this side does not know. The frame's
    /// safety flags ride along so a server can still acknowledge it.
    #[error("unknown opcode {op}")]
    UnknownOpcode { op: u32, flags: u32 },
    #[error("batch is already executing")]
    BatchState,
    #[error("{failed} of {total} batched operations failed")]
    Operations { failed: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Map a name or key onto one of `count` servers. The mapping is stable
/// across processes so that every client resolves the same placement.
pub(crate) fn server_index(key: &str, count: usize) -> usize {
    (xxhash_rust::xxh3::xxh3_64(key.as_bytes()) % count.max(1) as u64) as usize
}
