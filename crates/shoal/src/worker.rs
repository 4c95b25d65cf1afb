//! Fixed-size pool of background workers executing submitted tasks.
//!
//! Tasks queue onto a shared channel; each worker repeatedly takes the
//! next one and drives it to completion. Submitting returns a
//! [`TaskHandle`] the caller may wait on for the task's output. Shutting
//! down drains everything still queued before returning.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

type Job = BoxFuture<'static, ()>;

pub struct WorkerPool {
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..size.max(1))
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(run_worker(rx))
            })
            .collect();

        Self {
            queue: Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    /// A pool sized to the host's available parallelism.
    pub fn with_default_size() -> Self {
        let size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(size)
    }

    /// Queue `task` for execution on the pool.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // The receiver may have been dropped; the task still ran.
            let _ = tx.send(task.await);
        });

        let queue = self.queue.lock().unwrap();
        let sender = queue.as_ref().expect("worker pool is shut down");
        if sender.send(job).is_err() {
            panic!("worker pool is shut down");
        }
        TaskHandle { completion: rx }
    }

    /// Stop accepting tasks, then wait for the workers to drain the queue.
    pub async fn shutdown(&self) {
        drop(self.queue.lock().unwrap().take());
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
    }
}

async fn run_worker(rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>) {
    loop {
        // The lock is held only while waiting for the next job, never
        // while running one.
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { return };
        job.await;
    }
}

/// Completion handle for a submitted task.
pub struct TaskHandle<T> {
    completion: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task to finish and take its output.
    pub async fn wait(self) -> T {
        self.completion
            .await
            .expect("worker pool dropped a pending task")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn tasks_return_their_output() {
        let pool = WorkerPool::new(2);

        let handles: Vec<_> = (0..8u64).map(|i| pool.submit(async move { i * i })).collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().await, (i * i) as u64);
        }

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn workers_run_tasks_concurrently() {
        let pool = WorkerPool::new(2);
        let (a_tx, a_rx) = oneshot::channel::<()>();
        let (b_tx, b_rx) = oneshot::channel::<()>();

        // Each task completes only once the other has started, which
        // requires both workers to be running at once.
        let first = pool.submit(async move {
            let _ = b_tx.send(());
            a_rx.await.unwrap();
        });
        let second = pool.submit(async move {
            let _ = a_tx.send(());
            b_rx.await.unwrap();
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            first.wait().await;
            second.wait().await;
        })
        .await
        .unwrap();

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queued_tasks() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for _ in 0..16 {
            let counter = counter.clone();
            // Handles are dropped; the tasks must still run.
            let _ = pool.submit(async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        pool.shutdown().await;

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 16);
    }
}
