//! Ordered batches of operations and the pipeline that executes them.
//!
//! A batch collects operation descriptors in append order. On execute, the
//! pipeline partitions them into maximal runs of contiguous operations
//! sharing a kind and a target merge key, then dispatches each run as a
//! whole: one backend write batch, or one framed message to one server.
//! Relative order across differing kinds is never changed; a failing run
//! does not stop the runs after it.

use crate::kv::{self, GetSink, KvInner};
use crate::object::{self, ByteCount, ObjectInner, ReadSlot, StatusSlot};
use crate::runtime::Runtime;
use crate::semantics::{Ordering as BatchOrdering, Safety, Semantics};
use crate::worker::TaskHandle;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which of the two stores an operation addresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum StoreKind {
    Object,
    Kv,
}

/// The merge key: adjacent operations may share a run only when these
/// fields are equal (and their kinds match).
///
/// Read and write frames carry their object name in the frame prefix, so
/// those operations additionally pin `name`; everything else leaves it
/// unset and merges across names within a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub store: StoreKind,
    pub index: usize,
    pub namespace: Arc<str>,
    pub name: Option<Arc<str>>,
}

pub(crate) struct Operation {
    pub target: Target,
    pub kind: OpKind,
}

pub(crate) enum OpKind {
    ObjectCreate {
        object: Arc<ObjectInner>,
    },
    ObjectDelete {
        object: Arc<ObjectInner>,
    },
    ObjectSync {
        object: Arc<ObjectInner>,
    },
    ObjectStatus {
        object: Arc<ObjectInner>,
        slot: StatusSlot,
    },
    ObjectRead {
        object: Arc<ObjectInner>,
        length: u64,
        offset: u64,
        slot: ReadSlot,
    },
    ObjectWrite {
        object: Arc<ObjectInner>,
        data: Bytes,
        offset: u64,
        written: ByteCount,
    },
    KvPut {
        kv: Arc<KvInner>,
        value: Bytes,
    },
    KvDelete {
        kv: Arc<KvInner>,
    },
    KvGet {
        kv: Arc<KvInner>,
        sink: GetSink,
    },
}

impl OpKind {
    fn ordinal(&self) -> u8 {
        match self {
            OpKind::ObjectCreate { .. } => 0,
            OpKind::ObjectDelete { .. } => 1,
            OpKind::ObjectSync { .. } => 2,
            OpKind::ObjectStatus { .. } => 3,
            OpKind::ObjectRead { .. } => 4,
            OpKind::ObjectWrite { .. } => 5,
            OpKind::KvPut { .. } => 6,
            OpKind::KvDelete { .. } => 7,
            OpKind::KvGet { .. } => 8,
        }
    }
}

/// An ordered container of operations executed together under one
/// semantics bundle.
///
/// A batch is a single-owner value: executing takes the accumulated
/// operations, and once it completes, appending starts a fresh list.
/// While a background execution is in flight the batch counts as
/// executing, and advancing it — appending or executing again — is
/// rejected with [`crate::Error::BatchState`] until the handle resolves.
/// Use separate batches from separate tasks; the runtime underneath is
/// shared safely.
pub struct Batch {
    runtime: Arc<Runtime>,
    semantics: Semantics,
    ops: Vec<Operation>,
    executing: Arc<AtomicBool>,
}

impl Batch {
    pub fn new(runtime: &Arc<Runtime>, semantics: Semantics) -> Self {
        Self {
            runtime: runtime.clone(),
            semantics,
            ops: Vec::new(),
            executing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn semantics(&self) -> &Semantics {
        &self.semantics
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn push(&mut self, op: Operation) -> crate::Result<()> {
        if self.executing.load(Ordering::Acquire) {
            return Err(crate::Error::BatchState);
        }
        self.ops.push(op);
        Ok(())
    }

    /// Execute all accumulated operations.
    ///
    /// At `Safety::None` the batch may be deferred to the operation cache
    /// and reports success immediately; any stronger safety first drains
    /// previously deferred batches, preserving submission order.
    pub async fn execute(&mut self) -> crate::Result<()> {
        if self.executing.load(Ordering::Acquire) {
            return Err(crate::Error::BatchState);
        }
        let ops = std::mem::take(&mut self.ops);
        execute_with_cache(self.runtime.clone(), self.semantics, ops).await
    }

    /// Execute on the background worker pool; the returned handle resolves
    /// with the batch outcome. The batch stays marked executing until the
    /// submitted task finishes.
    pub fn execute_background(&mut self) -> crate::Result<TaskHandle<crate::Result<()>>> {
        if self.executing.swap(true, Ordering::AcqRel) {
            return Err(crate::Error::BatchState);
        }
        let ops = std::mem::take(&mut self.ops);
        let runtime = self.runtime.clone();
        let semantics = self.semantics;
        let executing = self.executing.clone();
        Ok(self.runtime.workers().submit(async move {
            let result = execute_with_cache(runtime, semantics, ops).await;
            executing.store(false, Ordering::Release);
            result
        }))
    }
}

pub(crate) async fn execute_with_cache(
    runtime: Arc<Runtime>,
    semantics: Semantics,
    ops: Vec<Operation>,
) -> crate::Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    if semantics.safety == Safety::None {
        runtime.cache().defer(&runtime, semantics, ops).await;
        return Ok(());
    }
    runtime.cache().flush(&runtime).await;
    execute_operations(&runtime, semantics, ops).await
}

pub(crate) async fn execute_operations(
    runtime: &Runtime,
    semantics: Semantics,
    mut ops: Vec<Operation>,
) -> crate::Result<()> {
    if semantics.ordering == BatchOrdering::Relaxed {
        // Stable sort: order within a (target, kind) group is preserved.
        ops.sort_by(|a, b| {
            let key = |op: &Operation| {
                (
                    op.target.store,
                    op.target.index,
                    op.target.namespace.clone(),
                    op.target.name.clone(),
                    op.kind.ordinal(),
                )
            };
            key(a).cmp(&key(b))
        });
    }

    let mut result = Ok(());
    let mut iter = ops.into_iter().peekable();

    while let Some(first) = iter.next() {
        let mut run = vec![first];
        if semantics.ordering != BatchOrdering::Strict {
            while let Some(next) = iter.peek() {
                let head = &run[0];
                if next.target == head.target && next.kind.ordinal() == head.kind.ordinal() {
                    run.push(iter.next().expect("peeked operation"));
                } else {
                    break;
                }
            }
        }

        if let Err(err) = execute_run(runtime, &semantics, run).await {
            tracing::warn!(error = %err, "batched run failed");
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    result
}

async fn execute_run(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    match run[0].kind {
        OpKind::ObjectCreate { .. } | OpKind::ObjectDelete { .. } | OpKind::ObjectSync { .. } => {
            object::execute_meta_run(runtime, semantics, run).await
        }
        OpKind::ObjectStatus { .. } => object::execute_status_run(runtime, semantics, run).await,
        OpKind::ObjectRead { .. } => object::execute_read_run(runtime, semantics, run).await,
        OpKind::ObjectWrite { .. } => object::execute_write_run(runtime, semantics, run).await,
        OpKind::KvPut { .. } | OpKind::KvDelete { .. } => {
            kv::execute_write_run(runtime, semantics, run).await
        }
        OpKind::KvGet { .. } => kv::execute_get_run(runtime, semantics, run).await,
    }
}

/// Per-run accounting: every sub-operation either succeeds or is counted
/// as failed, and the first concrete error is the one reported.
pub(crate) struct RunOutcome {
    total: usize,
    failed: usize,
    first: Option<crate::Error>,
}

impl RunOutcome {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            failed: 0,
            first: None,
        }
    }

    pub fn fail(&mut self, err: crate::Error) {
        self.failed += 1;
        if self.first.is_none() {
            self.first = Some(err);
        }
    }

    pub fn fail_silent(&mut self) {
        self.failed += 1;
    }

    pub fn finish(self) -> crate::Result<()> {
        if self.failed == 0 {
            Ok(())
        } else if let Some(err) = self.first {
            Err(err)
        } else {
            Err(crate::Error::Operations {
                failed: self.failed,
                total: self.total,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Component, Configuration, StoreConfig};
    use crate::semantics::{Ordering as BatchOrdering, Safety, Semantics};
    use crate::{Kv, Object};
    use bytes::{Bytes, BytesMut};
    use shoal_backend::{
        BackendObject, CommitMode, KvBackend, KvScan, KvWriteBatch, MemoryKvBackend,
        MemoryObjectBackend, ObjectBackend,
    };
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Delegates to the memory backend, recording every entry call so
    /// tests can assert on dispatch order and run boundaries.
    struct RecordingObject {
        log: Log,
        inner: MemoryObjectBackend,
    }

    #[async_trait::async_trait]
    impl ObjectBackend for RecordingObject {
        async fn create(
            &self,
            namespace: &str,
            name: &str,
        ) -> shoal_backend::Result<Box<dyn BackendObject>> {
            self.log
                .lock()
                .unwrap()
                .push(format!("object create {namespace}/{name}"));
            self.inner.create(namespace, name).await
        }

        async fn open(
            &self,
            namespace: &str,
            name: &str,
        ) -> shoal_backend::Result<Box<dyn BackendObject>> {
            self.log
                .lock()
                .unwrap()
                .push(format!("object open {namespace}/{name}"));
            self.inner.open(namespace, name).await
        }
    }

    struct RecordingKv {
        log: Log,
        inner: MemoryKvBackend,
    }

    #[async_trait::async_trait]
    impl KvBackend for RecordingKv {
        async fn write_batch(
            &self,
            namespace: &str,
            mode: CommitMode,
        ) -> shoal_backend::Result<Box<dyn KvWriteBatch>> {
            Ok(Box::new(RecordingWriteBatch {
                log: self.log.clone(),
                staged: Vec::new(),
                inner: self.inner.write_batch(namespace, mode).await?,
            }))
        }

        async fn get(&self, namespace: &str, key: &str) -> shoal_backend::Result<Option<Bytes>> {
            self.log
                .lock()
                .unwrap()
                .push(format!("kv get {namespace}/{key}"));
            self.inner.get(namespace, key).await
        }

        async fn scan(
            &self,
            namespace: &str,
            prefix: Option<&str>,
        ) -> shoal_backend::Result<KvScan> {
            self.inner.scan(namespace, prefix).await
        }
    }

    struct RecordingWriteBatch {
        log: Log,
        staged: Vec<String>,
        inner: Box<dyn KvWriteBatch>,
    }

    #[async_trait::async_trait]
    impl KvWriteBatch for RecordingWriteBatch {
        fn put(&mut self, key: &str, value: Bytes) {
            self.staged.push(format!("put {key}"));
            self.inner.put(key, value);
        }

        fn delete(&mut self, key: &str) {
            self.staged.push(format!("delete {key}"));
            self.inner.delete(key);
        }

        async fn commit(self: Box<Self>) -> shoal_backend::Result<()> {
            let RecordingWriteBatch { log, staged, inner } = *self;
            log.lock()
                .unwrap()
                .push(format!("kv commit [{}]", staged.join(", ")));
            inner.commit().await
        }
    }

    /// Holds every commit behind a Notify so tests can observe a batch
    /// while its execution is still in flight.
    struct GatedKv {
        gate: Arc<tokio::sync::Notify>,
        inner: MemoryKvBackend,
    }

    #[async_trait::async_trait]
    impl KvBackend for GatedKv {
        async fn write_batch(
            &self,
            namespace: &str,
            mode: CommitMode,
        ) -> shoal_backend::Result<Box<dyn KvWriteBatch>> {
            Ok(Box::new(GatedWriteBatch {
                gate: self.gate.clone(),
                inner: self.inner.write_batch(namespace, mode).await?,
            }))
        }

        async fn get(&self, namespace: &str, key: &str) -> shoal_backend::Result<Option<Bytes>> {
            self.inner.get(namespace, key).await
        }

        async fn scan(
            &self,
            namespace: &str,
            prefix: Option<&str>,
        ) -> shoal_backend::Result<KvScan> {
            self.inner.scan(namespace, prefix).await
        }
    }

    struct GatedWriteBatch {
        gate: Arc<tokio::sync::Notify>,
        inner: Box<dyn KvWriteBatch>,
    }

    #[async_trait::async_trait]
    impl KvWriteBatch for GatedWriteBatch {
        fn put(&mut self, key: &str, value: Bytes) {
            self.inner.put(key, value);
        }

        fn delete(&mut self, key: &str) {
            self.inner.delete(key);
        }

        async fn commit(self: Box<Self>) -> shoal_backend::Result<()> {
            let GatedWriteBatch { gate, inner } = *self;
            gate.notified().await;
            inner.commit().await
        }
    }

    fn local_config() -> Configuration {
        Configuration {
            max_connections: 1,
            object_servers: Vec::new(),
            kv_servers: Vec::new(),
            object: StoreConfig {
                backend: "memory".into(),
                component: Component::Client,
                path: String::new(),
            },
            kv: StoreConfig {
                backend: "memory".into(),
                component: Component::Client,
                path: String::new(),
            },
        }
    }

    fn recording_runtime() -> (Arc<Runtime>, Log) {
        let log = Log::default();
        let object = Arc::new(RecordingObject {
            log: log.clone(),
            inner: MemoryObjectBackend::new(),
        });
        let kv = Arc::new(RecordingKv {
            log: log.clone(),
            inner: MemoryKvBackend::new(),
        });
        let runtime = Runtime::with_backends(local_config(), Some(object), Some(kv)).unwrap();
        (runtime, log)
    }

    fn taken(log: &Log) -> Vec<String> {
        std::mem::take(&mut *log.lock().unwrap())
    }

    #[tokio::test]
    async fn empty_batches_execute_trivially() {
        let (runtime, log) = recording_runtime();
        let mut batch = Batch::new(&runtime, Semantics::default());
        batch.execute().await.unwrap();
        assert!(taken(&log).is_empty());
    }

    #[tokio::test]
    async fn contiguous_compatible_operations_share_one_run() {
        let (runtime, log) = recording_runtime();
        let mut batch = Batch::new(&runtime, Semantics::default());

        // put, put, delete, put: the delete splits the puts into three
        // runs, each one backend write batch.
        for key in ["k1", "k2"] {
            Kv::new(&runtime, "x", key)
                .unwrap()
                .put(&mut batch, Bytes::from_static(b"v")).unwrap();
        }
        Kv::new(&runtime, "x", "k3").unwrap().delete(&mut batch).unwrap();
        Kv::new(&runtime, "x", "k4")
            .unwrap()
            .put(&mut batch, Bytes::from_static(b"v")).unwrap();

        batch.execute().await.unwrap();
        assert_eq!(
            taken(&log),
            vec![
                "kv commit [put k1, put k2]",
                "kv commit [delete k3]",
                "kv commit [put k4]",
            ]
        );
    }

    #[tokio::test]
    async fn namespaces_split_runs() {
        let (runtime, log) = recording_runtime();
        let mut batch = Batch::new(&runtime, Semantics::default());

        Kv::new(&runtime, "a", "k1")
            .unwrap()
            .put(&mut batch, Bytes::from_static(b"v")).unwrap();
        Kv::new(&runtime, "b", "k2")
            .unwrap()
            .put(&mut batch, Bytes::from_static(b"v")).unwrap();

        batch.execute().await.unwrap();
        assert_eq!(
            taken(&log),
            vec!["kv commit [put k1]", "kv commit [put k2]"]
        );
    }

    #[tokio::test]
    async fn append_order_is_preserved_across_kinds() {
        let (runtime, log) = recording_runtime();
        let mut batch = Batch::new(&runtime, Semantics::default());

        Object::new(&runtime, "ns", "o1").unwrap().create(&mut batch).unwrap();
        Kv::new(&runtime, "ns", "k")
            .unwrap()
            .put(&mut batch, Bytes::from_static(b"v")).unwrap();
        Object::new(&runtime, "ns", "o2").unwrap().create(&mut batch).unwrap();

        batch.execute().await.unwrap();
        assert_eq!(
            taken(&log),
            vec![
                "object create ns/o1",
                "kv commit [put k]",
                "object create ns/o2",
            ]
        );
    }

    #[tokio::test]
    async fn relaxed_ordering_regroups_by_target_and_kind() {
        let (runtime, log) = recording_runtime();
        let semantics = Semantics::default().with_ordering(BatchOrdering::Relaxed);
        let mut batch = Batch::new(&runtime, semantics);

        Object::new(&runtime, "ns", "o1").unwrap().create(&mut batch).unwrap();
        Kv::new(&runtime, "ns", "a")
            .unwrap()
            .put(&mut batch, Bytes::from_static(b"v")).unwrap();
        Object::new(&runtime, "ns", "o2").unwrap().create(&mut batch).unwrap();
        Kv::new(&runtime, "ns", "b")
            .unwrap()
            .put(&mut batch, Bytes::from_static(b"v")).unwrap();

        batch.execute().await.unwrap();
        assert_eq!(
            taken(&log),
            vec![
                "object create ns/o1",
                "object create ns/o2",
                "kv commit [put a, put b]",
            ]
        );
    }

    #[tokio::test]
    async fn strict_ordering_never_merges() {
        let (runtime, log) = recording_runtime();
        let semantics = Semantics::default().with_ordering(BatchOrdering::Strict);
        let mut batch = Batch::new(&runtime, semantics);

        Kv::new(&runtime, "ns", "a")
            .unwrap()
            .put(&mut batch, Bytes::from_static(b"1")).unwrap();
        Kv::new(&runtime, "ns", "b")
            .unwrap()
            .put(&mut batch, Bytes::from_static(b"2")).unwrap();

        batch.execute().await.unwrap();
        assert_eq!(
            taken(&log),
            vec!["kv commit [put a]", "kv commit [put b]"]
        );
    }

    #[tokio::test]
    async fn a_failing_run_does_not_stop_later_runs() {
        let (runtime, log) = recording_runtime();
        let mut batch = Batch::new(&runtime, Semantics::default());

        Object::new(&runtime, "ns", "missing")
            .unwrap()
            .delete(&mut batch).unwrap();
        Kv::new(&runtime, "ns", "k")
            .unwrap()
            .put(&mut batch, Bytes::from_static(b"v")).unwrap();

        assert!(batch.execute().await.is_err());
        assert_eq!(
            taken(&log),
            vec!["object open ns/missing", "kv commit [put k]"]
        );
    }

    #[tokio::test]
    async fn safety_none_batches_are_deferred_until_a_safe_batch_executes() {
        let (runtime, log) = recording_runtime();

        let mut deferred = Batch::new(&runtime, Semantics::default().with_safety(Safety::None));
        Kv::new(&runtime, "ns", "early")
            .unwrap()
            .put(&mut deferred, Bytes::from_static(b"1")).unwrap();
        deferred.execute().await.unwrap();

        // Nothing reached the backend yet.
        assert!(taken(&log).is_empty());

        let mut trigger = Batch::new(&runtime, Semantics::default());
        Kv::new(&runtime, "ns", "late")
            .unwrap()
            .put(&mut trigger, Bytes::from_static(b"2")).unwrap();
        trigger.execute().await.unwrap();

        // The deferred batch drained first, then the triggering one ran.
        assert_eq!(
            taken(&log),
            vec!["kv commit [put early]", "kv commit [put late]"]
        );
    }

    #[tokio::test]
    async fn a_full_cache_flushes_synchronously() {
        let (runtime, log) = recording_runtime();

        for i in 0..crate::cache::DEFAULT_CAPACITY {
            let mut batch = Batch::new(&runtime, Semantics::default().with_safety(Safety::None));
            Kv::new(&runtime, "ns", &format!("k{i}"))
                .unwrap()
                .put(&mut batch, Bytes::from_static(b"v")).unwrap();
            batch.execute().await.unwrap();
        }

        assert_eq!(taken(&log).len(), crate::cache::DEFAULT_CAPACITY);
    }

    #[tokio::test]
    async fn shutdown_flushes_deferred_batches() {
        let (runtime, log) = recording_runtime();

        let mut batch = Batch::new(&runtime, Semantics::default().with_safety(Safety::None));
        Kv::new(&runtime, "ns", "k")
            .unwrap()
            .put(&mut batch, Bytes::from_static(b"v")).unwrap();
        batch.execute().await.unwrap();
        assert!(taken(&log).is_empty());

        runtime.shutdown().await;
        assert_eq!(taken(&log), vec!["kv commit [put k]"]);
    }

    #[tokio::test]
    async fn object_write_then_read_at_offset() {
        let runtime = Runtime::new(local_config()).unwrap();
        let object = Object::new(&runtime, "ns", "o").unwrap();
        let payload: Bytes = (0..=255u8).collect::<Vec<_>>().into();

        let mut batch = Batch::new(&runtime, Semantics::default());
        object.create(&mut batch).unwrap();
        let written = object.write(&mut batch, payload.clone(), 256).unwrap();
        batch.execute().await.unwrap();
        assert_eq!(written.get(), 256);

        let mut batch = Batch::new(&runtime, Semantics::default());
        let slot = object.read(&mut batch, BytesMut::zeroed(256), 256).unwrap();
        batch.execute().await.unwrap();

        assert_eq!(slot.len(), 256);
        assert_eq!(slot.bytes(), payload);
    }

    #[tokio::test]
    async fn kv_put_then_get_round_trips() {
        let runtime = Runtime::new(local_config()).unwrap();
        let kv = Kv::new(&runtime, "ns", "k").unwrap();

        let mut batch = Batch::new(&runtime, Semantics::default());
        kv.put(&mut batch, Bytes::from_static(b"\x01\x02\x03")).unwrap();
        batch.execute().await.unwrap();

        let mut batch = Batch::new(&runtime, Semantics::default());
        let slot = kv.get(&mut batch).unwrap();
        batch.execute().await.unwrap();
        assert_eq!(slot.value(), Some(Bytes::from_static(b"\x01\x02\x03")));
    }

    #[tokio::test]
    async fn background_execution_resolves_through_the_handle() {
        let runtime = Runtime::new(local_config()).unwrap();
        let object = Object::new(&runtime, "ns", "bg").unwrap();

        let mut batch = Batch::new(&runtime, Semantics::default());
        object.create(&mut batch).unwrap();
        let handle = batch.execute_background().unwrap();
        handle.wait().await.unwrap();

        let mut batch = Batch::new(&runtime, Semantics::default());
        let status = object.status(&mut batch).unwrap();
        batch.execute().await.unwrap();
        assert_eq!(status.get().unwrap().size, 0);
    }

    #[tokio::test]
    async fn a_batch_can_be_reused_after_execute() {
        let (runtime, log) = recording_runtime();
        let mut batch = Batch::new(&runtime, Semantics::default());
        let kv = Kv::new(&runtime, "ns", "k").unwrap();

        kv.put(&mut batch, Bytes::from_static(b"1")).unwrap();
        batch.execute().await.unwrap();
        assert_eq!(taken(&log).len(), 1);

        // Appending after execute starts a fresh operation list.
        assert!(batch.is_empty());
        kv.put(&mut batch, Bytes::from_static(b"2")).unwrap();
        assert_eq!(batch.len(), 1);
        batch.execute().await.unwrap();
        assert_eq!(taken(&log).len(), 1);
    }

    #[tokio::test]
    async fn advancing_a_batch_while_it_executes_is_rejected() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let kv_backend = Arc::new(GatedKv {
            gate: gate.clone(),
            inner: MemoryKvBackend::new(),
        });
        let runtime = Runtime::with_backends(
            local_config(),
            Some(Arc::new(MemoryObjectBackend::new())),
            Some(kv_backend),
        )
        .unwrap();

        let kv = Kv::new(&runtime, "ns", "k").unwrap();
        let mut batch = Batch::new(&runtime, Semantics::default());
        kv.put(&mut batch, Bytes::from_static(b"v")).unwrap();

        let handle = batch.execute_background().unwrap();

        // The execution is parked behind the gate: the batch may not be
        // advanced until it completes.
        assert!(matches!(
            kv.put(&mut batch, Bytes::from_static(b"x")),
            Err(crate::Error::BatchState)
        ));
        assert!(matches!(
            batch.execute().await,
            Err(crate::Error::BatchState)
        ));
        assert!(matches!(
            batch.execute_background().err(),
            Some(crate::Error::BatchState)
        ));

        gate.notify_one();
        handle.wait().await.unwrap();

        // Completion reopens the batch for a fresh list.
        kv.put(&mut batch, Bytes::from_static(b"w")).unwrap();
        gate.notify_one();
        batch.execute().await.unwrap();
    }
}
