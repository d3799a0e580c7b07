//! Process event loop.
//!
//! A thin layer over the tokio runtime that adds what the runtime needs on top
//! of plain `tokio::spawn`:
//!
//! - **Instance attribution.** Tasks created with [`EventLoop::create_task`]
//!   run inside a task-local scope naming their owning instance;
//!   [`current_instance`] recovers it from anywhere inside the task.
//! - **Strands.** A [`Strand`] runs posted futures one at a time in posting
//!   order. Each signal/slot endpoint processes incoming calls on a strand.
//! - **Worker pool.** [`EventLoop::run_blocking`] hands blocking or CPU-bound
//!   work to `spawn_blocking`, bounded by a semaphore.
//! - **Signal handling.** [`EventLoop::set_signal_handler`] fires a handler on
//!   SIGINT/SIGTERM and stops the loop.
//!
//! Servers run it on a current-thread runtime, so everything except the
//! worker pool is cooperative and single threaded.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{KaraboError, KaraboResult};

tokio::task_local! {
    static CURRENT_INSTANCE: String;
}

/// Id of the instance owning the running task, if any.
pub fn current_instance() -> Option<String> {
    CURRENT_INSTANCE.try_with(|id| id.clone()).ok()
}

/// Run `fut` attributed to `instance`.
pub fn scoped<F>(instance: impl Into<String>, fut: F) -> tokio::task::futures::TaskLocalFuture<String, F>
where
    F: Future,
{
    CURRENT_INSTANCE.scope(instance.into(), fut)
}

static GLOBAL: OnceCell<EventLoop> = OnceCell::new();

/// Handle to the process event loop. Cheap to clone.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    workers: Arc<Semaphore>,
    worker_count: usize,
    stop_tx: watch::Sender<bool>,
    pending: AtomicUsize,
    idle: Notify,
}

/// Decrements the pending-task counter when a tracked task ends.
struct PendingGuard(Arc<LoopInner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl EventLoop {
    /// Event loop with a worker pool of `worker_threads` slots.
    pub fn new(worker_threads: usize) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(LoopInner {
                workers: Arc::new(Semaphore::new(worker_threads.max(1))),
                worker_count: worker_threads.max(1),
                stop_tx,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Install the process-wide loop; later calls return the first one.
    pub fn init_global(worker_threads: usize) -> EventLoop {
        GLOBAL.get_or_init(|| EventLoop::new(worker_threads)).clone()
    }

    /// The process-wide loop, created with four workers on first use.
    pub fn global() -> EventLoop {
        Self::init_global(4)
    }

    /// Number of worker pool slots.
    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    fn track(&self) -> PendingGuard {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        PendingGuard(self.inner.clone())
    }

    /// Schedule `fut` after `delay`, attributed to the current instance.
    pub fn post<F>(&self, fut: F, delay: Duration) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.track();
        let instance = current_instance().unwrap_or_default();
        tokio::spawn(scoped(instance, async move {
            let _guard = guard;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            fut.await;
        }))
    }

    /// Spawn `fut` as a task owned by `instance`.
    pub fn create_task<F>(&self, instance: impl Into<String>, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.track();
        tokio::spawn(scoped(instance, async move {
            let _guard = guard;
            fut.await
        }))
    }

    /// Run blocking work on the bounded worker pool.
    pub async fn run_blocking<F, R>(&self, f: F) -> KaraboResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self
            .inner
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| KaraboError::Cancelled("worker pool closed".into()))?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| KaraboError::Cancelled(format!("worker task failed: {e}")))
    }

    /// Ask [`work`](Self::work) and [`run`](Self::run) to return.
    pub fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
    }

    /// True once [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    /// Drive the loop until [`stop`](Self::stop).
    pub async fn work(&self) {
        let mut rx = self.inner.stop_tx.subscribe();
        // Only fails if the sender is gone, which cannot outlive `self`.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Drive the loop until no posted or created task remains, or until stopped.
    pub async fn run(&self) {
        let mut stop = self.inner.stop_tx.subscribe();
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::Acquire) == 0 || *stop.borrow() {
                return;
            }
            tokio::select! {
                _ = idle => {}
                _ = stop.changed() => return,
            }
        }
    }

    /// Call `handler` on every SIGINT/SIGTERM with the delivery count, then stop.
    pub fn set_signal_handler<H>(&self, mut handler: H) -> JoinHandle<()>
    where
        H: FnMut(u32) + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let mut count = 0u32;
            loop {
                if wait_for_termination().await.is_err() {
                    tracing::warn!("signal handling unavailable");
                    return;
                }
                count += 1;
                tracing::info!(count, "termination signal received");
                handler(count);
                this.stop();
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = term.recv() => Ok(()),
        res = tokio::signal::ctrl_c() => res,
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

// =============================================================================
// Strand
// =============================================================================

/// Executes posted futures sequentially, in posting order.
#[derive(Clone)]
pub struct Strand {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl Strand {
    /// Start a strand whose futures are attributed to `instance`.
    pub fn new(instance: impl Into<String>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let handle = tokio::spawn(scoped(instance, async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        }));
        (Self { tx }, handle)
    }

    /// Queue `fut`; returns false if the strand has stopped.
    pub fn post<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.send(Box::pin(fut)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn create_task_attributes_instance() {
        let el = EventLoop::new(2);
        let seen = el
            .create_task("dev1", async { current_instance() })
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some("dev1"));
        assert_eq!(current_instance(), None);
    }

    #[tokio::test]
    async fn post_inherits_instance_and_run_waits() {
        let el = EventLoop::new(1);
        let out = Arc::new(Mutex::new(Vec::new()));
        let (el2, out2) = (el.clone(), out.clone());
        el.create_task("owner", async move {
            let out3 = out2.clone();
            el2.post(
                async move { out3.lock().push(current_instance()) },
                Duration::from_millis(20),
            );
        });
        el.run().await;
        assert_eq!(out.lock().as_slice(), &[Some("owner".to_string())]);
    }

    #[tokio::test]
    async fn strand_preserves_order() {
        let (strand, _handle) = Strand::new("s");
        let out = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let out = out.clone();
            strand.post(async move {
                if i % 7 == 0 {
                    tokio::task::yield_now().await;
                }
                out.lock().push(i);
            });
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        strand.post(async move {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert_eq!(*out.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn worker_pool_runs_blocking_work() {
        let el = EventLoop::new(2);
        let sum = el.run_blocking(|| (1..=10u64).sum::<u64>()).await.unwrap();
        assert_eq!(sum, 55);
    }

    #[tokio::test]
    async fn stop_releases_work() {
        let el = EventLoop::new(1);
        let el2 = el.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            el2.stop();
        });
        tokio::time::timeout(Duration::from_secs(2), el.work())
            .await
            .unwrap();
        assert!(el.is_stopped());
    }
}
