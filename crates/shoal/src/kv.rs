//! Public key-value API: opaque binary documents addressed by
//! (namespace, key), scheduled into batches.

use crate::batch::{Batch, OpKind, Operation, RunOutcome, StoreKind, Target};
use crate::message::{Message, Opcode};
use crate::pool;
use crate::runtime::Runtime;
use crate::semantics::{Safety, Semantics};
use bytes::Bytes;
use shoal_backend::{CommitMode, KvBackend};
use std::sync::{Arc, Mutex};

pub(crate) struct KvInner {
    pub namespace: Arc<str>,
    pub key: String,
    pub index: usize,
}

/// Client handle for one key. All operations on a handle target the same
/// server, derived from the key unless overridden.
#[derive(Clone)]
pub struct Kv {
    inner: Arc<KvInner>,
}

impl Kv {
    pub fn new(runtime: &Runtime, namespace: &str, key: &str) -> crate::Result<Self> {
        let index = crate::server_index(key, runtime.kv_server_count());
        Self::build(namespace, key, index)
    }

    /// Pin the handle to an explicit server index instead of hashing.
    pub fn with_index(
        runtime: &Runtime,
        namespace: &str,
        key: &str,
        index: usize,
    ) -> crate::Result<Self> {
        let count = runtime.kv_server_count();
        if count > 0 && index >= count {
            return Err(crate::Error::InvalidArgument(
                "kv server index out of range",
            ));
        }
        Self::build(namespace, key, index)
    }

    fn build(namespace: &str, key: &str, index: usize) -> crate::Result<Self> {
        for part in [namespace, key] {
            if part.is_empty() || part.contains('\0') {
                return Err(crate::Error::InvalidArgument(
                    "namespace and key must be non-empty and free of NUL",
                ));
            }
        }
        Ok(Self {
            inner: Arc::new(KvInner {
                namespace: namespace.into(),
                key: key.to_string(),
                index,
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn server_index(&self) -> usize {
        self.inner.index
    }

    fn target(&self) -> Target {
        Target {
            store: StoreKind::Kv,
            index: self.inner.index,
            namespace: self.inner.namespace.clone(),
            name: None,
        }
    }

    pub fn put(&self, batch: &mut Batch, value: Bytes) -> crate::Result<()> {
        batch.push(Operation {
            target: self.target(),
            kind: OpKind::KvPut {
                kv: self.inner.clone(),
                value,
            },
        })
    }

    pub fn delete(&self, batch: &mut Batch) -> crate::Result<()> {
        batch.push(Operation {
            target: self.target(),
            kind: OpKind::KvDelete {
                kv: self.inner.clone(),
            },
        })
    }

    /// Schedule a lookup. An absent key leaves the slot empty and fails
    /// that operation.
    pub fn get(&self, batch: &mut Batch) -> crate::Result<ValueSlot> {
        let slot = ValueSlot::default();
        batch.push(Operation {
            target: self.target(),
            kind: OpKind::KvGet {
                kv: self.inner.clone(),
                sink: GetSink::Slot(slot.clone()),
            },
        })?;
        Ok(slot)
    }

    /// Schedule a lookup whose raw value bytes are handed to `decode`
    /// without copying into a caller buffer.
    pub fn get_with<F>(&self, batch: &mut Batch, decode: F) -> crate::Result<()>
    where
        F: FnOnce(&[u8]) + Send + Sync + 'static,
    {
        batch.push(Operation {
            target: self.target(),
            kind: OpKind::KvGet {
                kv: self.inner.clone(),
                sink: GetSink::Decode(Some(Box::new(decode))),
            },
        })
    }
}

/// Receives the value of a scheduled lookup.
#[derive(Clone, Default)]
pub struct ValueSlot {
    inner: Arc<Mutex<Option<Bytes>>>,
}

impl ValueSlot {
    pub fn value(&self) -> Option<Bytes> {
        self.inner.lock().unwrap().clone()
    }

    fn set(&self, value: Bytes) {
        *self.inner.lock().unwrap() = Some(value);
    }
}

pub(crate) enum GetSink {
    Slot(ValueSlot),
    Decode(Option<Box<dyn FnOnce(&[u8]) + Send + Sync>>),
}

impl GetSink {
    fn deliver(&mut self, value: &Bytes) {
        match self {
            GetSink::Slot(slot) => slot.set(value.clone()),
            GetSink::Decode(decode) => {
                if let Some(decode) = decode.take() {
                    decode(value);
                }
            }
        }
    }
}

pub(crate) async fn execute_write_run(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    match runtime.kv_backend() {
        Some(backend) => write_local(backend, semantics, run).await,
        None => write_remote(runtime, semantics, run).await,
    }
}

async fn write_local(
    backend: &Arc<dyn KvBackend>,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    let mode = if semantics.safety == Safety::Storage {
        CommitMode::Durable
    } else {
        CommitMode::Buffered
    };

    // The whole run stages into one backend write batch and commits once.
    let mut wb = backend
        .write_batch(&run[0].target.namespace, mode)
        .await?;
    for op in &run {
        match &op.kind {
            OpKind::KvPut { kv, value } => wb.put(&kv.key, value.clone()),
            OpKind::KvDelete { kv } => wb.delete(&kv.key),
            _ => unreachable!("mixed run"),
        }
    }
    wb.commit().await?;
    Ok(())
}

async fn write_remote(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    let opcode = match run[0].kind {
        OpKind::KvPut { .. } => Opcode::KvPut,
        _ => Opcode::KvDelete,
    };

    // Like object create, kv writes always synchronize through the server
    // so a later batch on another pooled connection cannot overtake them.
    let mut effective = *semantics;
    if effective.safety == Safety::None {
        effective.safety = Safety::Network;
    }

    let mut msg = Message::new(opcode);
    msg.set_safety(&effective);
    msg.append_str(&run[0].target.namespace);
    for op in &run {
        msg.add_operation();
        match &op.kind {
            OpKind::KvPut { kv, value } => {
                msg.append_str(&kv.key);
                msg.append_u32(value.len() as u32);
                msg.append_bytes(value);
            }
            OpKind::KvDelete { kv } => msg.append_str(&kv.key),
            _ => unreachable!("mixed run"),
        }
    }

    let mut conn = runtime.pool().kv(run[0].target.index).await?;
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
                if msg.wants_storage() {
                    // Durable commits report a status per sub-op.
                    for _ in 0..reply.count() {
                        if answered == run.len() {
                            break;
                        }
                        if reply.get_u32()? != 0 {
                            outcome.fail_silent();
                        }
                        answered += 1;
                    }
                } else {
                    // The frame itself acknowledges receipt.
                    answered += reply.count() as usize;
                }
            }
        }
        outcome.finish()
    }
    .await;
    pool::finish(conn, result)
}

pub(crate) async fn execute_get_run(
    runtime: &Runtime,
    semantics: &Semantics,
    run: Vec<Operation>,
) -> crate::Result<()> {
    match runtime.kv_backend() {
        Some(backend) => get_local(backend, run).await,
        None => get_remote(runtime, semantics, run).await,
    }
}

async fn get_local(backend: &Arc<dyn KvBackend>, mut run: Vec<Operation>) -> crate::Result<()> {
    let mut outcome = RunOutcome::new(run.len());

    for op in &mut run {
        let OpKind::KvGet { kv, sink } = &mut op.kind else {
            unreachable!("mixed run")
        };
        match backend.get(&kv.namespace, &kv.key).await {
            Ok(Some(value)) => sink.deliver(&value),
            Ok(None) => outcome.fail_silent(),
            Err(err) => outcome.fail(err.into()),
        }
    }
    outcome.finish()
}

async fn get_remote(
    runtime: &Runtime,
    semantics: &Semantics,
    mut run: Vec<Operation>,
) -> crate::Result<()> {
    let mut msg = Message::new(Opcode::KvGet);
    msg.set_safety(semantics);
    msg.append_str(&run[0].target.namespace);
    for op in &run {
        let OpKind::KvGet { kv, .. } = &op.kind else {
            unreachable!("mixed run")
        };
        msg.add_operation();
        msg.append_str(&kv.key);
    }

    let mut conn = runtime.pool().kv(run[0].target.index).await?;
    let result = async {
        msg.send(conn.stream()).await?;

        // Lookups always reply, whatever the safety level.
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
                let len = reply.get_u32()?;
                let OpKind::KvGet { sink, .. } = &mut run[answered].kind else {
                    unreachable!("mixed run")
                };
                if len == 0 {
                    // Zero length means the key was absent.
                    outcome.fail_silent();
                } else {
                    let value = reply.get_bytes(len as usize)?;
                    sink.deliver(&value);
                }
                answered += 1;
            }
        }
        outcome.finish()
    }
    .await;
    pool::finish(conn, result)
}

/// Ordered iteration over the keys of a namespace, optionally restricted
/// to a prefix. Served by the client-side kv backend; the wire protocol
/// has no iteration opcode.
pub struct KvIterator {
    scan: shoal_backend::KvScan,
}

impl KvIterator {
    pub async fn new(
        runtime: &Runtime,
        namespace: &str,
        prefix: Option<&str>,
    ) -> crate::Result<Self> {
        let backend = runtime.kv_backend().ok_or(crate::Error::InvalidArgument(
            "kv iteration requires a client-side kv backend",
        ))?;
        Ok(Self {
            scan: backend.scan(namespace, prefix).await?,
        })
    }
}

impl Iterator for KvIterator {
    type Item = (String, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.scan.next()
    }
}
