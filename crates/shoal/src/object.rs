//! Public object API: named byte streams addressed by (namespace, name),
//! scheduled into batches.

use crate::batch::{Batch, OpKind, Operation, RunOutcome, StoreKind, Target};
use crate::message::{Message, Opcode};
use crate::pool;
use crate::runtime::Runtime;
use crate::semantics::{Safety, Semantics};
use bytes::{Bytes, BytesMut};
use shoal_backend::{ObjectBackend, ObjectStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

pub(crate) struct ObjectInner {
    pub namespace: Arc<str>,
    pub name: Arc<str>,
    pub index: usize,
}

/// Client handle for one stored object. All operations on a handle target
/// the same server, derived from the name unless overridden.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Object {
    pub fn new(runtime: &Runtime, namespace: &str, name: &str) -> crate::Result<Self> {
        let index = crate::server_index(name, runtime.object_server_count());
        Self::build(namespace, name, index)
    }

    /// Pin the handle to an explicit server index instead of hashing.
    pub fn with_index(
        runtime: &Runtime,
        namespace: &str,
        name: &str,
        index: usize,
    ) -> crate::Result<Self> {
        let count = runtime.object_server_count();
        if count > 0 && index >= count {
            return Err(crate::Error::InvalidArgument(
                "object server index out of range",
            ));
        }
        Self::build(namespace, name, index)
    }

    fn build(namespace: &str, name: &str, index: usize) -> crate::Result<Self> {
        for part in [namespace, name] {
            if part.is_empty() || part.contains('\0') {
                return Err(crate::Error::InvalidArgument(
                    "namespace and name must be non-empty and free of NUL",
                ));
            }
        }
        Ok(Self {
            inner: Arc::new(ObjectInner {
                namespace: namespace.into(),
                name: name.into(),
                index,
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn server_index(&self) -> usize {
        self.inner.index
    }

    /// Merge key for operations whose frames carry the name per sub-op.
    fn target(&self) -> Target {
        Target {
            store: StoreKind::Object,
            index: self.inner.index,
            namespace: self.inner.namespace.clone(),
            name: None,
        }
    }

    /// Merge key for read/write, whose frames address a single object.
    fn data_target(&self) -> Target {
        Target {
            name: Some(self.inner.name.clone()),
            ..self.target()
        }
    }

    pub fn create(&self, batch: &mut Batch) -> crate::Result<()> {
        batch.push(Operation {
            target: self.target(),
            kind: OpKind::ObjectCreate {
                object: self.inner.clone(),
            },
        })
    }

    pub fn delete(&self, batch: &mut Batch) -> crate::Result<()> {
        batch.push(Operation {
            target: self.target(),
            kind: OpKind::ObjectDelete {
                object: self.inner.clone(),
            },
        })
    }

    /// Flush the object's buffered writes to stable storage.
    pub fn sync(&self, batch: &mut Batch) -> crate::Result<()> {
        batch.push(Operation {
            target: self.target(),
            kind: OpKind::ObjectSync {
                object: self.inner.clone(),
            },
        })
    }

    pub fn status(&self, batch: &mut Batch) -> crate::Result<StatusSlot> {
        let slot = StatusSlot::default();
        batch.push(Operation {
            target: self.target(),
            kind: OpKind::ObjectStatus {
                object: self.inner.clone(),
                slot: slot.clone(),
            },
        })?;
        Ok(slot)
    }

    /// Schedule a read of `buf.len()` bytes at `offset`. The buffer is
    /// filled during execution and handed back through the returned slot.
    pub fn read(&self, batch: &mut Batch, buf: BytesMut, offset: u64) -> crate::Result<ReadSlot> {
        if buf.is_empty() {
            return Err(crate::Error::InvalidArgument("zero-length read"));
        }
        let length = buf.len() as u64;
        let slot = ReadSlot::new(buf);
        batch.push(Operation {
            target: self.data_target(),
            kind: OpKind::ObjectRead {
                object: self.inner.clone(),
                length,
                offset,
                slot: slot.clone(),
            },
        })?;
        Ok(slot)
    }

    /// Schedule a write of `data` at `offset`. The returned counter tracks
    /// how many bytes the store confirmed.
    pub fn write(&self, batch: &mut Batch, data: Bytes, offset: u64) -> crate::Result<ByteCount> {
        if data.is_empty() {
            return Err(crate::Error::InvalidArgument("zero-length write"));
        }
        let written = ByteCount::default();
        batch.push(Operation {
            target: self.data_target(),
            kind: OpKind::ObjectWrite {
                object: self.inner.clone(),
                data,
                offset,
                written: written.clone(),
            },
        })?;
        Ok(written)
    }
}

/// Shared progress counter for a scheduled read or write.
#[derive(Clone, Default)]
pub struct ByteCount {
    count: Arc<AtomicU64>,
}

impl ByteCount {
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }
}

/// Holds the caller's buffer while a scheduled read is in flight.
#[derive(Clone)]
pub struct ReadSlot {
    buf: Arc<Mutex<Option<BytesMut>>>,
    filled: ByteCount,
}

impl ReadSlot {
    fn new(buf: BytesMut) -> Self {
        Self {
            buf: Arc::new(Mutex::new(Some(buf))),
            filled: ByteCount::default(),
        }
    }

    /// Bytes confirmed so far.
    pub fn len(&self) -> u64 {
        self.filled.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the filled prefix of the buffer. Afterwards the slot is empty.
    pub fn bytes(&self) -> Bytes {
        let mut guard = self.buf.lock().unwrap();
        match guard.take() {
            Some(mut buf) => {
                buf.truncate(self.filled.get() as usize);
                buf.freeze()
            }
            None => Bytes::new(),
        }
    }

    pub(crate) fn take_buf(&self) -> Option<BytesMut> {
        self.buf.lock().unwrap().take()
    }

    pub(crate) fn put_back(&self, buf: BytesMut) {
        *self.buf.lock().unwrap() = Some(buf);
    }

    pub(crate) fn add_filled(&self, n: u64) {
        self.filled.add(n);
    }
}

/// Receives an object's modification time and size.
#[derive(Clone, Default)]
pub struct StatusSlot {
    inner: Arc<Mutex<Option<ObjectStatus>>>,
}

impl StatusSlot {
    pub fn get(&self) -> Option<ObjectStatus> {
        *self.inner.lock().unwrap()
    }

    pub(crate) fn set(&self, status: ObjectStatus) {
        *self.inner.lock().unwrap() = Some(status);
    }
}

fn op_object(kind: &OpKind) -> &Arc<ObjectInner> {
    match kind {
        OpKind::ObjectCreate { object }
        | OpKind::ObjectDelete { object }
        | OpKind::ObjectSync { object }
        | OpKind::ObjectStatus { object, .. }
        | OpKind::ObjectRead { object, .. }
        | OpKind::ObjectWrite { object, .. } => object,
        _ => unreachable!("not an object operation"),
    }
}

pub(crate) async fn execute_meta_run(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    match runtime.object_backend() {
        Some(backend) => meta_local(backend, run).await,
        None => meta_remote(runtime, semantics, run).await,
    }
}

async fn meta_local(backend: &Arc<dyn ObjectBackend>, run: Vec<Operation>) -> crate::Result<()> {
    let mut outcome = RunOutcome::new(run.len());

    for op in &run {
        let object = op_object(&op.kind);
        let result = async {
            match &op.kind {
                OpKind::ObjectCreate { .. } => {
                    backend.create(&object.namespace, &object.name).await?;
                }
                OpKind::ObjectDelete { .. } => {
                    backend
                        .open(&object.namespace, &object.name)
                        .await?
                        .delete()
                        .await?;
                }
                OpKind::ObjectSync { .. } => {
                    backend
                        .open(&object.namespace, &object.name)
                        .await?
                        .sync()
                        .await?;
                }
                _ => unreachable!("mixed run"),
            }
            Ok::<(), crate::Error>(())
        }
        .await;

        if let Err(err) = result {
            outcome.fail(err);
        }
    }
    outcome.finish()
}

async fn meta_remote(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    let opcode = match run[0].kind {
        OpKind::ObjectCreate { .. } => Opcode::ObjectCreate,
        OpKind::ObjectDelete { .. } => Opcode::ObjectDelete,
        _ => Opcode::ObjectSync,
    };

    // Create and delete always synchronize through the server: a later
    // batch may reach the same name over a different pooled connection.
    let mut effective = *semantics;
    if opcode != Opcode::ObjectSync && effective.safety == Safety::None {
        effective.safety = Safety::Network;
    }

    let mut msg = Message::new(opcode);
    msg.set_safety(&effective);
    msg.append_str(&run[0].target.namespace);
    for op in &run {
        msg.add_operation();
        msg.append_str(&op_object(&op.kind).name);
    }

    let mut conn = runtime.pool().object(run[0].target.index).await?;
    let result = async {
        msg.send(conn.stream()).await?;

        let mut outcome = RunOutcome::new(run.len());
        if msg.wants_reply() {
            let mut answered = 0;
            while answered < run.len() {
                let mut reply = Message::receive_reply(conn.stream()).await?;
                if reply.count() == 0 {
                    return Err(crate::Error::Protocol("empty reply frame"));
                }
                for _ in 0..reply.count() {
                    if answered == run.len() {
                        break;
                    }
                    if reply.get_u64()? != 0 {
                        outcome.fail_silent();
                    }
                    answered += 1;
                }
            }
        }
        outcome.finish()
    }
    .await;
    pool::finish(conn, result)
}

pub(crate) async fn execute_status_run(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    match runtime.object_backend() {
        Some(backend) => status_local(backend, run).await,
        None => status_remote(runtime, semantics, run).await,
    }
}

async fn status_local(backend: &Arc<dyn ObjectBackend>, run: Vec<Operation>) -> crate::Result<()> {
    let mut outcome = RunOutcome::new(run.len());

    for op in &run {
        let object = op_object(&op.kind);
        let OpKind::ObjectStatus { slot, .. } = &op.kind else {
            unreachable!("mixed run")
        };
        match async {
            backend
                .open(&object.namespace, &object.name)
                .await?
                .status()
                .await
                .map_err(crate::Error::from)
        }
        .await
        {
            Ok(status) => slot.set(status),
            Err(err) => outcome.fail(err),
        }
    }
    outcome.finish()
}

async fn status_remote(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    let mut msg = Message::new(Opcode::ObjectStatus);
    msg.set_safety(semantics);
    msg.append_str(&run[0].target.namespace);
    for op in &run {
        msg.add_operation();
        msg.append_str(&op_object(&op.kind).name);
    }

    let mut conn = runtime.pool().object(run[0].target.index).await?;
    let result = async {
        msg.send(conn.stream()).await?;

        // Status always replies, whatever the safety level.
        let mut outcome = RunOutcome::new(run.len());
        let mut answered = 0;
        while answered < run.len() {
            let mut reply = Message::receive_reply(conn.stream()).await?;
            if reply.count() == 0 {
                return Err(crate::Error::Protocol("empty reply frame"));
            }
            for _ in 0..reply.count() {
                if answered == run.len() {
                    break;
                }
                let modified = reply.get_i64()?;
                let size = reply.get_u64()?;
                let OpKind::ObjectStatus { slot, .. } = &run[answered].kind else {
                    unreachable!("mixed run")
                };
                // A negative modification time marks a failed sub-op.
                if modified < 0 {
                    outcome.fail_silent();
                } else {
                    slot.set(ObjectStatus { modified, size });
                }
                answered += 1;
            }
        }
        outcome.finish()
    }
    .await;
    pool::finish(conn, result)
}

pub(crate) async fn execute_write_run(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    match runtime.object_backend() {
        Some(backend) => write_local(backend, semantics, run).await,
        None => write_remote(runtime, semantics, run).await,
    }
}

async fn write_local(
    backend: &Arc<dyn ObjectBackend>,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    let mut outcome = RunOutcome::new(run.len());

    for op in &run {
        let object = op_object(&op.kind);
        let OpKind::ObjectWrite {
            data,
            offset,
            written,
            ..
        } = &op.kind
        else {
            unreachable!("mixed run")
        };

        let result = async {
            let handle = backend.open(&object.namespace, &object.name).await?;
            let n = handle.write(data.clone(), *offset).await?;
            written.add(n as u64);
            if semantics.safety == Safety::Storage {
                handle.sync().await?;
            }
            Ok::<(), crate::Error>(())
        }
        .await;

        if let Err(err) = result {
            outcome.fail(err);
        }
    }
    outcome.finish()
}

async fn write_remote(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    let mut msg = Message::new(Opcode::ObjectWrite);
    msg.set_safety(semantics);
    msg.append_str(&run[0].target.namespace);
    msg.append_str(&op_object(&run[0].kind).name);
    for op in &run {
        let OpKind::ObjectWrite { data, offset, .. } = &op.kind else {
            unreachable!("mixed run")
        };
        msg.add_operation();
        msg.append_u64(data.len() as u64);
        msg.append_u64(*offset);
        msg.add_send(data.clone());
    }

    let mut conn = runtime.pool().object(run[0].target.index).await?;
    let result = async {
        msg.send(conn.stream()).await?;

        let mut outcome = RunOutcome::new(run.len());
        if !msg.wants_reply() {
            // Fire and forget: optimistically credit the full length.
            for op in &run {
                let OpKind::ObjectWrite { data, written, .. } = &op.kind else {
                    unreachable!("mixed run")
                };
                written.add(data.len() as u64);
            }
            return outcome.finish();
        }

        let mut answered = 0;
        while answered < run.len() {
            let mut reply = Message::receive_reply(conn.stream()).await?;
            if reply.count() == 0 {
                return Err(crate::Error::Protocol("empty reply frame"));
            }
            for _ in 0..reply.count() {
                if answered == run.len() {
                    break;
                }
                let n = reply.get_u64()?;
                let OpKind::ObjectWrite { data, written, .. } = &run[answered].kind else {
                    unreachable!("mixed run")
                };
                written.add(n);
                if n < data.len() as u64 {
                    outcome.fail_silent();
                }
                answered += 1;
            }
        }
        outcome.finish()
    }
    .await;
    pool::finish(conn, result)
}

pub(crate) async fn execute_read_run(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    match runtime.object_backend() {
        Some(backend) => read_local(backend, run).await,
        None => read_remote(runtime, semantics, run).await,
    }
}

async fn read_local(backend: &Arc<dyn ObjectBackend>, run: Vec<Operation>) -> crate::Result<()> {
    let mut outcome = RunOutcome::new(run.len());

    for op in &run {
        let object = op_object(&op.kind);
        let OpKind::ObjectRead { offset, slot, .. } = &op.kind else {
            unreachable!("mixed run")
        };
        let Some(mut buf) = slot.take_buf() else {
            outcome.fail(crate::Error::InvalidArgument("read buffer already taken"));
            continue;
        };

        let result = async {
            let handle = backend.open(&object.namespace, &object.name).await?;
            let n = handle.read(&mut buf, *offset).await?;
            slot.add_filled(n as u64);
            Ok::<(), crate::Error>(())
        }
        .await;

        slot.put_back(buf);
        if let Err(err) = result {
            outcome.fail(err);
        }
    }
    outcome.finish()
}

async fn read_remote(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    let mut msg = Message::new(Opcode::ObjectRead);
    msg.set_safety(semantics);
    msg.append_str(&run[0].target.namespace);
    msg.append_str(&op_object(&run[0].kind).name);
    for op in &run {
        let OpKind::ObjectRead { length, offset, .. } = &op.kind else {
            unreachable!("mixed run")
        };
        msg.add_operation();
        msg.append_u64(*length);
        msg.append_u64(*offset);
    }

    let mut conn = runtime.pool().object(run[0].target.index).await?;
    let result = async {
        msg.send(conn.stream()).await?;

        // The server may spread the answers over several reply frames;
        // each frame's bulk payload follows its body on the stream and is
        // read straight into the caller-provided buffers.
        let outcome = RunOutcome::new(run.len());
        let mut answered = 0;
        while answered < run.len() {
            let mut reply = Message::receive_reply(conn.stream()).await?;
            if reply.count() == 0 {
                return Err(crate::Error::Protocol("empty reply frame"));
            }

            let mut lengths = Vec::with_capacity(reply.count() as usize);
            for _ in 0..reply.count() {
                lengths.push(reply.get_u64()?);
            }

            for n in lengths {
                if answered == run.len() {
                    return Err(crate::Error::Protocol("more replies than requests"));
                }
                let OpKind::ObjectRead { length, slot, .. } = &run[answered].kind else {
                    unreachable!("mixed run")
                };
                if n > *length {
                    return Err(crate::Error::Protocol("reply exceeds requested length"));
                }
                if n > 0 {
                    let Some(mut buf) = slot.take_buf() else {
                        return Err(crate::Error::InvalidArgument("read buffer already taken"));
                    };
                    let read = conn.stream().read_exact(&mut buf[..n as usize]).await;
                    slot.put_back(buf);
                    read?;
                    slot.add_filled(n);
                }
                answered += 1;
            }
        }
        outcome.finish()
    }
    .await;
    pool::finish(conn, result)
}
