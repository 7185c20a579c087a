//! Bounded worker pool
//!
//! Executes handler jobs on a bounded set of long-lived workers fed from a
//! bounded backlog. Submission never blocks the caller: when the backlog is
//! full the job is rejected outright, and the consumer turns that rejection
//! into a NACK. This is the only backpressure the adapter exposes to the
//! queue service.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Surplus workers retire after this long without work
const IDLE_KEEPALIVE: Duration = Duration::from_secs(30);

type Job = BoxFuture<'static, ()>;

/// Rejection signal returned when the backlog is full or the pool is stopped
#[derive(Debug, PartialEq, Eq)]
pub struct PoolSaturated;

struct PoolShared {
    jobs: AsyncMutex<mpsc::Receiver<Job>>,
    /// Live workers, floor `min_workers`, ceiling `max_workers`
    workers: AtomicUsize,
    /// Workers currently executing a job
    busy: AtomicUsize,
    min_workers: usize,
    max_workers: usize,
}

/// Bounded executor shared by all consumers of one adapter
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool with `min_workers` spawned eagerly
    pub fn new(min_workers: usize, max_workers: usize, max_backlog: usize) -> Self {
        let (tx, rx) = mpsc::channel(max_backlog);

        let shared = Arc::new(PoolShared {
            jobs: AsyncMutex::new(rx),
            workers: AtomicUsize::new(min_workers),
            busy: AtomicUsize::new(0),
            min_workers,
            max_workers,
        });

        let pool = Self {
            tx: Mutex::new(Some(tx)),
            shared,
            handles: Mutex::new(Vec::new()),
        };

        for _ in 0..min_workers {
            pool.spawn_worker();
        }

        tracing::debug!(
            min_workers,
            max_workers,
            max_backlog,
            "Worker pool started"
        );

        pool
    }

    /// Submit a job without blocking
    ///
    /// Errors with [`PoolSaturated`] when the backlog is full or the pool has
    /// been shut down.
    pub fn try_submit<F>(&self, job: F) -> Result<(), PoolSaturated>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = match &*self.tx.lock().expect("worker pool lock poisoned") {
            Some(tx) => tx.clone(),
            None => return Err(PoolSaturated),
        };

        match tx.try_send(Box::pin(job)) {
            Ok(()) => {
                self.maybe_grow();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PoolSaturated),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PoolSaturated),
        }
    }

    /// Spawn an extra worker when every live worker is busy and the ceiling
    /// has not been reached
    fn maybe_grow(&self) {
        loop {
            let workers = self.shared.workers.load(Ordering::Acquire);
            let busy = self.shared.busy.load(Ordering::Acquire);

            if workers >= self.shared.max_workers || busy < workers {
                return;
            }

            if self
                .shared
                .workers
                .compare_exchange(workers, workers + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.spawn_worker();
                return;
            }
        }
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(worker_loop(shared));
        self.handles
            .lock()
            .expect("worker pool lock poisoned")
            .push(handle);
    }

    /// Stop accepting jobs, then wait for the backlog and in-flight jobs to
    /// finish
    pub async fn shutdown(&self) {
        drop(self.tx.lock().expect("worker pool lock poisoned").take());

        let handles = std::mem::take(&mut *self.handles.lock().expect("worker pool lock poisoned"));
        for handle in handles {
            let _ = handle.await;
        }

        tracing::debug!("Worker pool stopped");
    }
}

async fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut jobs = shared.jobs.lock().await;
            match tokio::time::timeout(IDLE_KEEPALIVE, jobs.recv()).await {
                Ok(Some(job)) => {
                    // Count as busy before releasing the channel so the
                    // grow heuristic doesn't mistake this worker for idle.
                    shared.busy.fetch_add(1, Ordering::AcqRel);
                    job
                }
                // Channel closed and drained: pool shutdown.
                Ok(None) => break,
                // Idle; retire if above the floor, otherwise keep waiting.
                Err(_) => {
                    let workers = shared.workers.load(Ordering::Acquire);
                    if workers > shared.min_workers
                        && shared
                            .workers
                            .compare_exchange(
                                workers,
                                workers - 1,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                    {
                        return;
                    }
                    continue;
                }
            }
        };

        // A panicking job must not take the worker down with it.
        if std::panic::AssertUnwindSafe(job).catch_unwind().await.is_err() {
            tracing::error!("worker job panicked");
        }
        shared.busy.fetch_sub(1, Ordering::AcqRel);
    }

    shared.workers.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_runs_submitted_jobs() {
        let pool = WorkerPool::new(1, 2, 4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.try_submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejects_when_backlog_full() {
        let pool = WorkerPool::new(1, 1, 1);
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        // Occupy the only worker until the gate opens.
        {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            pool.try_submit(async move {
                started.notify_one();
                gate.notified().await;
            })
            .unwrap();
        }
        started.notified().await;

        // Backlog of one: first queued job fits, the next is rejected.
        pool.try_submit(async {}).unwrap();
        assert_eq!(pool.try_submit(async {}), Err(PoolSaturated));

        gate.notify_waiters();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_max_workers() {
        let pool = WorkerPool::new(1, 2, 8);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            pool.try_submit(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_backlog() {
        let pool = WorkerPool::new(1, 1, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.try_submit(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let pool = WorkerPool::new(1, 1, 1);
        pool.shutdown().await;
        assert_eq!(pool.try_submit(async {}), Err(PoolSaturated));
    }
}
