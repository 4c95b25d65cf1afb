//! Deferred execution of fire-and-forget batches.
//!
//! A batch executing at `Safety::None` asks for no acknowledgment, so the
//! pipeline may queue it here and report success immediately. The queue
//! drains, in submission order, before any batch that does want an
//! acknowledgment executes, and when the queue is full or the runtime
//! shuts down. Failures of deferred batches can only be logged; the
//! caller already moved on.

use crate::batch::{self, Operation};
use crate::runtime::Runtime;
use crate::semantics::Semantics;
use std::collections::VecDeque;

pub(crate) const DEFAULT_CAPACITY: usize = 64;

pub(crate) struct OperationCache {
    queue: tokio::sync::Mutex<VecDeque<Deferred>>,
    capacity: usize,
}

struct Deferred {
    semantics: Semantics,
    ops: Vec<Operation>,
}

impl OperationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: tokio::sync::Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Queue a fire-and-forget batch. A full queue flushes synchronously.
    pub async fn defer(&self, runtime: &Runtime, semantics: Semantics, ops: Vec<Operation>) {
        let mut queue = self.queue.lock().await;
        queue.push_back(Deferred { semantics, ops });
        if queue.len() >= self.capacity {
            drain(runtime, &mut queue).await;
        }
    }

    /// Execute everything deferred so far, in submission order.
    pub async fn flush(&self, runtime: &Runtime) {
        let mut queue = self.queue.lock().await;
        drain(runtime, &mut queue).await;
    }
}

async fn drain(runtime: &Runtime, queue: &mut VecDeque<Deferred>) {
    while let Some(deferred) = queue.pop_front() {
        if let Err(err) =
            batch::execute_operations(runtime, deferred.semantics, deferred.ops).await
        {
            tracing::warn!(error = %err, "deferred batch failed");
        }
    }
}
