//! Single-flight task scheduling per flow.
//!
//! Every flow gets a lane: a FIFO queue drained by one tokio task. Work for
//! the same flow therefore runs one item at a time, in submission order,
//! while different flows run in parallel up to the pool size. Lanes are
//! created on demand and removed as soon as their queue is empty.

use crate::config::ConfigHandle;
use flow_core::FlowId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::AbortHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("task was cancelled before it completed")]
    Cancelled,
}

struct Lane {
    jobs: mpsc::UnboundedSender<Job>,
    abort: AbortHandle,
}

struct Inner {
    lanes: Mutex<HashMap<FlowId, Lane>>,
    permits: Arc<Semaphore>,
    pool_size: Mutex<usize>,
    accepting: AtomicBool,
    // Every lane holds a clone; shutdown waits for the last one to drop.
    drain_tx: Mutex<Option<mpsc::Sender<()>>>,
    drain_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs tasks with at most one in flight per [`FlowId`].
///
/// Cloning a scheduler yields another handle to the same lanes and pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler running at most `pool_size` flows at once.
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        let (drain_tx, drain_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                lanes: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(pool_size)),
                pool_size: Mutex::new(pool_size),
                accepting: AtomicBool::new(true),
                drain_tx: Mutex::new(Some(drain_tx)),
                drain_rx: tokio::sync::Mutex::new(drain_rx),
            }),
        }
    }

    /// Create a scheduler sized from `config` that follows pool size changes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_config(config: &ConfigHandle) -> Self {
        let scheduler = Self::new(config.current().pool_size());
        let weak = Arc::downgrade(&scheduler.inner);
        let mut changes = config.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let size = changes.borrow_and_update().pool_size();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Scheduler { inner }.resize(size);
            }
        });
        scheduler
    }

    /// Queue `task` on the lane of `flow_id`.
    ///
    /// The task starts once every task queued earlier for the same flow has
    /// finished and a pool slot is free. Await the returned handle for its
    /// output.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ShuttingDown`] once shutdown has begun.
    pub fn run_or_resume<F, T>(&self, flow_id: FlowId, task: F) -> Result<TaskHandle<T>, SchedulerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(task.await);
        });

        let mut lanes = lock(&self.inner.lanes);
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShuttingDown);
        }
        let job = match lanes.get(&flow_id) {
            Some(lane) => match lane.jobs.send(job) {
                Ok(()) => return Ok(TaskHandle { rx }),
                // The lane died (aborted or panicked); replace it.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let Some(drain) = lock(&self.inner.drain_tx).clone() else {
            return Err(SchedulerError::ShuttingDown);
        };
        let (jobs, queue) = mpsc::unbounded_channel();
        let _ = jobs.send(job);
        let handle = tokio::spawn(run_lane(Arc::clone(&self.inner), flow_id, queue, drain));
        lanes.insert(
            flow_id,
            Lane {
                jobs,
                abort: handle.abort_handle(),
            },
        );
        tracing::debug!(flow_id = %flow_id, "opened scheduler lane");
        Ok(TaskHandle { rx })
    }

    /// Change the number of flows that may run at once.
    ///
    /// Shrinking takes effect as running flows release their slots.
    pub fn resize(&self, size: usize) {
        let size = size.max(1);
        let mut current = lock(&self.inner.pool_size);
        if size == *current {
            return;
        }
        if size > *current {
            self.inner.permits.add_permits(size - *current);
        } else {
            let excess = u32::try_from(*current - size).unwrap_or(u32::MAX);
            let permits = Arc::clone(&self.inner.permits);
            tokio::spawn(async move {
                if let Ok(permit) = permits.acquire_many_owned(excess).await {
                    permit.forget();
                }
            });
        }
        tracing::info!(from = *current, to = size, "resized scheduler pool");
        *current = size;
    }

    pub fn pool_size(&self) -> usize {
        *lock(&self.inner.pool_size)
    }

    /// Flows with queued or running work.
    pub fn active_lanes(&self) -> usize {
        lock(&self.inner.lanes).len()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting work and wait for every queued and running task to finish.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        {
            let _lanes = lock(&self.inner.lanes);
            lock(&self.inner.drain_tx).take();
        }
        let mut drain = self.inner.drain_rx.lock().await;
        while drain.recv().await.is_some() {}
        tracing::info!("scheduler drained");
    }

    /// Abort every lane immediately.
    ///
    /// Only for fatal engine shutdown: a flow aborted mid-event may have
    /// produced side effects its last committed checkpoint does not reflect.
    pub fn halt(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        let mut lanes = lock(&self.inner.lanes);
        for (flow_id, lane) in lanes.drain() {
            tracing::warn!(flow_id = %flow_id, "aborting scheduler lane");
            lane.abort.abort();
        }
        lock(&self.inner.drain_tx).take();
    }
}

async fn run_lane(
    inner: Arc<Inner>,
    flow_id: FlowId,
    mut queue: mpsc::UnboundedReceiver<Job>,
    _drain: mpsc::Sender<()>,
) {
    loop {
        let job = match queue.try_recv() {
            Ok(job) => job,
            Err(_) => {
                // Re-check under the lock: submitters only send while holding it.
                let mut lanes = lock(&inner.lanes);
                match queue.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        lanes.remove(&flow_id);
                        tracing::debug!(flow_id = %flow_id, "closed scheduler lane");
                        return;
                    }
                }
            }
        };
        let Ok(_permit) = Arc::clone(&inner.permits).acquire_owned().await else {
            return;
        };
        job.await;
    }
}

/// Completion handle for a scheduled task.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| SchedulerError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn settle_lanes(scheduler: &Scheduler) {
        for _ in 0..100 {
            if scheduler.active_lanes() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_and_order_per_flow() {
        let scheduler = Scheduler::new(8);
        let flow_id = FlowId::new();
        let gauge = Arc::new(Gauge::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let gauge = Arc::clone(&gauge);
            let order = Arc::clone(&order);
            let handle = scheduler
                .run_or_resume(flow_id, async move {
                    gauge.enter();
                    tokio::task::yield_now().await;
                    order.lock().unwrap().push(i);
                    gauge.exit();
                    i
                })
                .unwrap();
            handles.push(handle);
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i);
        }
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
        settle_lanes(&scheduler).await;
        assert_eq!(scheduler.active_lanes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_different_flows_run_concurrently() {
        let scheduler = Scheduler::new(2);
        let barrier = Arc::new(Barrier::new(2));
        let a = {
            let barrier = Arc::clone(&barrier);
            scheduler
                .run_or_resume(FlowId::new(), async move {
                    barrier.wait().await;
                })
                .unwrap()
        };
        let b = {
            let barrier = Arc::clone(&barrier);
            scheduler
                .run_or_resume(FlowId::new(), async move {
                    barrier.wait().await;
                })
                .unwrap()
        };
        timeout(Duration::from_secs(5), async {
            a.await.unwrap();
            b.await.unwrap();
        })
        .await
        .expect("flows should not block each other");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_size_bounds_concurrency() {
        let scheduler = Scheduler::new(2);
        let gauge = Arc::new(Gauge::default());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let gauge = Arc::clone(&gauge);
            handles.push(
                scheduler
                    .run_or_resume(FlowId::new(), async move {
                        gauge.enter();
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        gauge.exit();
                    })
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resize_grows_pool() {
        let scheduler = Scheduler::new(1);
        scheduler.resize(2);
        assert_eq!(scheduler.pool_size(), 2);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                scheduler
                    .run_or_resume(FlowId::new(), async move {
                        barrier.wait().await;
                    })
                    .unwrap()
            })
            .collect();
        timeout(Duration::from_secs(5), async {
            for handle in handles {
                handle.await.unwrap();
            }
        })
        .await
        .expect("resized pool should run both flows");
    }

    #[tokio::test]
    async fn test_follows_config_changes() {
        let source = crate::config::ConfigSource::new(crate::config::FlowConfig::default().with_pool_size(1));
        let scheduler = Scheduler::with_config(&source.handle());
        assert_eq!(scheduler.pool_size(), 1);

        source.modify(|c| c.scheduler_pool_size = 3);
        for _ in 0..100 {
            if scheduler.pool_size() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(scheduler.pool_size(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_work() {
        let scheduler = Scheduler::new(1);
        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let done = Arc::clone(&done);
            handles.push(
                scheduler
                    .run_or_resume(FlowId::new(), async move {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap(),
            );
        }

        scheduler.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!scheduler.is_accepting());
        assert_eq!(
            scheduler.run_or_resume(FlowId::new(), async {}).err(),
            Some(SchedulerError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn test_halt_cancels_pending_work() {
        let scheduler = Scheduler::new(1);
        let handle = scheduler
            .run_or_resume(FlowId::new(), std::future::pending::<()>())
            .unwrap();
        tokio::task::yield_now().await;
        scheduler.halt();
        assert_eq!(handle.await, Err(SchedulerError::Cancelled));
        assert_eq!(scheduler.active_lanes(), 0);
        // Halting also releases anyone waiting on a graceful drain.
        timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .expect("drain should finish after halt");
    }
}
