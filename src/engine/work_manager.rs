// Bounded-concurrency scheduler for the sub-steps of composite operations.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::debug;

use crate::config::DEFAULT_MAX_CONCURRENT_WORK;

/// How a queued unit of work left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// The work was handed to the runtime.
    Dispatched,
    /// The queue was drained before the work started.
    Cancelled,
}

/// Resolves once the associated work leaves the queue.
pub struct Suspension {
    rx: oneshot::Receiver<WorkStatus>,
}

impl Future for Suspension {
    type Output = WorkStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WorkStatus> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|status| status.unwrap_or(WorkStatus::Cancelled))
    }
}

struct QueuedWork {
    work: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    dispatched: oneshot::Sender<WorkStatus>,
}

pub struct WorkManager {
    runtime: Handle,
    permits: Arc<Semaphore>,
    max_concurrent_work: usize,
    queue: Mutex<VecDeque<QueuedWork>>,
    active: AtomicUsize,
    idle: Notify,
}

impl WorkManager {
    pub fn new(runtime: Handle) -> Arc<Self> {
        Self::with_max_concurrent_work(runtime, DEFAULT_MAX_CONCURRENT_WORK)
    }

    pub fn with_max_concurrent_work(runtime: Handle, max_concurrent_work: usize) -> Arc<Self> {
        let max_concurrent_work = max_concurrent_work.max(1);
        Arc::new(Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent_work)),
            max_concurrent_work,
            queue: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Append `work` to the queue without starting it. Call `execute_work`
    /// once a batch has been queued.
    pub fn queue_work<F>(&self, work: F) -> Suspension
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queue.lock().push_back(QueuedWork {
            work: Box::pin(work),
            dispatched: tx,
        });
        Suspension { rx }
    }

    /// Start queued work until the concurrency cap is reached. Each finished
    /// unit calls this again, so the pipeline stays saturated.
    pub fn execute_work(self: &Arc<Self>) {
        loop {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                return;
            };
            let Some(item) = self.queue.lock().pop_front() else {
                return;
            };

            self.active.fetch_add(1, Ordering::SeqCst);
            let manager = Arc::clone(self);
            self.runtime.spawn(async move {
                item.work.await;
                drop(permit);
                manager.active.fetch_sub(1, Ordering::SeqCst);
                manager.execute_work();
                if !manager.has_work_remaining() {
                    manager.idle.notify_waiters();
                }
            });
            let _ = item.dispatched.send(WorkStatus::Dispatched);
        }
    }

    /// Drop everything still queued. Running work is left alone.
    pub fn cancel(&self) {
        let drained: Vec<QueuedWork> = self.queue.lock().drain(..).collect();
        if !drained.is_empty() {
            debug!("work manager cancelled {} queued units", drained.len());
        }
        for item in drained {
            let _ = item.dispatched.send(WorkStatus::Cancelled);
        }
        if !self.has_work_remaining() {
            self.idle.notify_waiters();
        }
    }

    pub fn has_work_remaining(&self) -> bool {
        self.active_work() > 0 || self.queued_work() > 0
    }

    pub fn active_work(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queued_work(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn max_concurrent_work(&self) -> usize {
        self.max_concurrent_work
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.has_work_remaining() {
                return;
            }
            notified.await;
        }
    }
}
