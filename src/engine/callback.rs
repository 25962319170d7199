// Ordered delivery of user callbacks and state observers off the engine's locks.

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// FIFO executor backed by one task. Cloning shares the same queue, so jobs
/// posted from any clone run in posting order.
#[derive(Clone)]
pub struct CallbackExecutor {
    tx: mpsc::UnboundedSender<Job>,
}

impl CallbackExecutor {
    pub fn spawn(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!("callback executor drained");
        });
        Self { tx }
    }

    /// Executor on the runtime of the calling task.
    pub fn current() -> Self {
        Self::spawn(&Handle::current())
    }

    /// Queue `job`. When the executor task is gone the job runs inline and
    /// `false` is returned, so posted callbacks are never lost.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.tx.send(Box::new(job)) {
            Ok(()) => true,
            Err(mpsc::error::SendError(job)) => {
                job();
                false
            }
        }
    }
}
