//! Process-wide client state: configuration, connection pool, background
//! workers, the operation cache, and any in-process backends.
//!
//! A Runtime is built explicitly and threaded to call sites as an
//! `Arc<Runtime>`; there is no hidden global. Construction spawns the
//! background workers, so it must happen inside a Tokio runtime.

use crate::cache::{self, OperationCache};
use crate::config::{Component, Configuration};
use crate::pool::ConnectionPool;
use crate::worker::WorkerPool;
use shoal_backend::{KvBackend, ObjectBackend};
use std::sync::Arc;

pub struct Runtime {
    config: Configuration,
    pool: ConnectionPool,
    workers: WorkerPool,
    cache: OperationCache,
    object_backend: Option<Arc<dyn ObjectBackend>>,
    kv_backend: Option<Arc<dyn KvBackend>>,
}

impl Runtime {
    /// Build a runtime from a configuration, resolving in-process
    /// backends for every store whose component is `client`.
    pub fn new(config: Configuration) -> crate::Result<Arc<Self>> {
        let object_backend = match config.object.component {
            Component::Client => Some(shoal_backend::object_backend(
                &config.object.backend,
                &config.object.path,
            )?),
            Component::Server => None,
        };
        let kv_backend = match config.kv.component {
            Component::Client => Some(shoal_backend::kv_backend(
                &config.kv.backend,
                &config.kv.path,
            )?),
            Component::Server => None,
        };
        Self::build(config, object_backend, kv_backend)
    }

    /// Build a runtime from the configuration found in the environment.
    pub fn load() -> crate::Result<Arc<Self>> {
        Self::new(Configuration::load()?)
    }

    /// Build a runtime around caller-supplied backend instances instead
    /// of the named ones; `None` keeps a store remote.
    pub fn with_backends(
        config: Configuration,
        object_backend: Option<Arc<dyn ObjectBackend>>,
        kv_backend: Option<Arc<dyn KvBackend>>,
    ) -> crate::Result<Arc<Self>> {
        Self::build(config, object_backend, kv_backend)
    }

    fn build(
        config: Configuration,
        object_backend: Option<Arc<dyn ObjectBackend>>,
        kv_backend: Option<Arc<dyn KvBackend>>,
    ) -> crate::Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            pool: ConnectionPool::new(&config),
            workers: WorkerPool::with_default_size(),
            cache: OperationCache::new(cache::DEFAULT_CAPACITY),
            config,
            object_backend,
            kv_backend,
        }))
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn object_server_count(&self) -> usize {
        self.config.object_servers.len()
    }

    pub fn kv_server_count(&self) -> usize {
        self.config.kv_servers.len()
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub(crate) fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub(crate) fn cache(&self) -> &OperationCache {
        &self.cache
    }

    pub(crate) fn object_backend(&self) -> Option<&Arc<dyn ObjectBackend>> {
        self.object_backend.as_ref()
    }

    pub(crate) fn kv_backend(&self) -> Option<&Arc<dyn KvBackend>> {
        self.kv_backend.as_ref()
    }

    /// Flush deferred batches and drain the background workers. Call once,
    /// when the process is done with the runtime.
    pub async fn shutdown(&self) {
        self.cache.flush(self).await;
        self.workers.shutdown().await;
    }
}
