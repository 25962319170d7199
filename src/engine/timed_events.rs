// Deadline multiplexer: many timed events served by one sleeping driver task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Why the processor is being handed an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The deadline passed.
    Fired,
    /// The scheduler was cancelled or stopped before the deadline.
    Cancelled,
}

type Processor<E> = Arc<dyn Fn(E, EventOutcome) + Send + Sync>;

struct State<E> {
    events: BTreeMap<(Instant, u64), E>,
    next_seq: u64,
    stopped: bool,
}

struct Shared<E> {
    state: Mutex<State<E>>,
    notify: Notify,
    processor: Processor<E>,
}

pub struct TimedEvents<E: Send + 'static> {
    shared: Arc<Shared<E>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Send + 'static> TimedEvents<E> {
    /// The processor runs on the driver task for fired events and on the
    /// caller's task for cancelled ones. It must not call back into this
    /// scheduler while holding locks the caller might hold.
    pub fn new<F>(handle: &Handle, processor: F) -> Self
    where
        F: Fn(E, EventOutcome) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                events: BTreeMap::new(),
                next_seq: 0,
                stopped: false,
            }),
            notify: Notify::new(),
            processor: Arc::new(processor),
        });
        let driver = handle.spawn(Self::drive(Arc::clone(&shared)));
        Self {
            shared,
            driver: Mutex::new(Some(driver)),
        }
    }

    pub fn add_at(&self, deadline: Instant, event: E) {
        let rejected = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                Some(event)
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                let becomes_earliest = state
                    .events
                    .keys()
                    .next()
                    .map_or(true, |(first, _)| deadline < *first);
                state.events.insert((deadline, seq), event);
                if becomes_earliest {
                    self.shared.notify.notify_one();
                }
                None
            }
        };
        if let Some(event) = rejected {
            (self.shared.processor)(event, EventOutcome::Cancelled);
        }
    }

    pub fn add_after(&self, delay: Duration, event: E) {
        self.add_at(Instant::now() + delay, event);
    }

    pub fn size(&self) -> usize {
        self.shared.state.lock().events.len()
    }

    /// Flush every pending event to the processor as `Cancelled`.
    pub fn cancel_all(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            std::mem::take(&mut state.events)
        };
        if !drained.is_empty() {
            debug!("timed events cancelled count={}", drained.len());
        }
        for (_, event) in drained {
            (self.shared.processor)(event, EventOutcome::Cancelled);
        }
    }

    /// Cancel pending events and shut the driver down. Later additions are
    /// reported as `Cancelled` straight away.
    pub fn stop(&self) {
        self.shared.state.lock().stopped = true;
        self.cancel_all();
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }

    async fn drive(shared: Arc<Shared<E>>) {
        loop {
            let next_deadline = {
                let mut state = shared.state.lock();
                if state.stopped {
                    return;
                }
                let now = Instant::now();
                let mut due = Vec::new();
                while let Some(entry) = state.events.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    due.push(entry.remove());
                }
                if !due.is_empty() {
                    drop(state);
                    for event in due {
                        (shared.processor)(event, EventOutcome::Fired);
                    }
                    continue;
                }
                state.events.keys().next().map(|(deadline, _)| *deadline)
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = shared.notify.notified() => {}
                    }
                }
                None => shared.notify.notified().await,
            }
        }
    }
}

impl<E: Send + 'static> Drop for TimedEvents<E> {
    fn drop(&mut self) {
        self.stop();
    }
}
