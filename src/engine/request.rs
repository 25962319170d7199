// Request wrapper: carries one descriptor from enqueue to its single callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::callback::CallbackExecutor;
use crate::api::{ApiResponse, Descriptor, SessionTokenData};
use crate::error::ApiError;
use crate::transport::Transport;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// What a finished round trip reported, stripped of the typed response.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub error: Option<ApiError>,
    pub new_key: bool,
}

/// Receives request lifecycle notifications. Implemented by the maintainer.
pub trait CompletionSink: Send + Sync {
    /// Every finished round trip reports here first, for connection tracking.
    fn on_completion_notification(&self, error: Option<&ApiError>);

    /// The request is finished and its callback has been posted.
    fn on_completed(&self, request: &RequestRef, outcome: &Outcome);

    /// The request hit a retryable error within its retry budget. The
    /// callback has not been invoked; the sink decides where it goes next.
    fn on_retry(&self, request: &RequestRef, outcome: &Outcome);
}

/// Type-erased view of a queued request, as stored by the locker.
pub trait PendingRequest: Send + Sync + 'static {
    fn id(&self) -> u64;

    fn needs_token(&self) -> bool;

    /// Instant after which a still-waiting request times out.
    fn deadline(&self) -> Instant;

    /// Instant after which retryable errors are delivered instead of retried.
    fn max_retry_time(&self) -> Instant;

    fn stamp_token(&self, token: &SessionTokenData);

    /// Start the round trip on `handle`. A request that was already failed or
    /// cancelled skips the transport and only reports completion to `sink`.
    fn init(self: Arc<Self>, transport: Arc<dyn Transport>, sink: Weak<dyn CompletionSink>, handle: &Handle);

    /// Deliver `ApiError::Cancelled` and abort any in-flight round trip.
    fn cancel(&self);

    /// Deliver `error` and abort any in-flight round trip.
    fn fail(&self, error: ApiError);

    /// The callback has been delivered.
    fn is_finished(&self) -> bool;
}

pub type RequestRef = Arc<dyn PendingRequest>;

type Callback<R> = Box<dyn FnOnce(R) + Send + 'static>;

enum Phase {
    Idle,
    InFlight(CancellationToken),
    Done,
}

pub struct MaintainerRequest<D: Descriptor> {
    id: u64,
    deadline: Instant,
    max_retry_time: Instant,
    timeout: Duration,
    executor: CallbackExecutor,
    descriptor: Mutex<D>,
    callback: Mutex<Option<Callback<D::Response>>>,
    phase: Mutex<Phase>,
}

impl<D: Descriptor> MaintainerRequest<D> {
    /// Wrap `descriptor`; it times out and stops retrying `timeout` from now.
    pub fn new<F>(descriptor: D, callback: F, executor: CallbackExecutor, timeout: Duration) -> Arc<Self>
    where
        F: FnOnce(D::Response) + Send + 'static,
    {
        let now = Instant::now();
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            deadline: now + timeout,
            max_retry_time: now + timeout,
            timeout,
            executor,
            descriptor: Mutex::new(descriptor),
            callback: Mutex::new(Some(Box::new(callback))),
            phase: Mutex::new(Phase::Idle),
        })
    }

    fn deliver(&self, response: D::Response) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            self.executor.post(move || callback(response));
        }
    }

    fn finish_with(&self, error: ApiError) {
        let in_flight = {
            let mut phase = self.phase.lock();
            match std::mem::replace(&mut *phase, Phase::Done) {
                Phase::InFlight(token) => Some(token),
                _ => None,
            }
        };
        if let Some(token) = in_flight {
            token.cancel();
        }
        self.deliver(D::Response::from_error(error));
    }

    fn complete(self: Arc<Self>, response: D::Response, sink: Weak<dyn CompletionSink>) {
        let outcome = Outcome {
            error: response.error().cloned(),
            new_key: response.new_key(),
        };
        let sink = sink.upgrade();
        if let Some(sink) = &sink {
            if outcome.error != Some(ApiError::Cancelled) {
                sink.on_completion_notification(outcome.error.as_ref());
            }
        }

        let me: RequestRef = self.clone();
        let retryable = D::NEEDS_TOKEN
            && Instant::now() < self.max_retry_time
            && outcome.error.as_ref().is_some_and(ApiError::is_retryable);

        if let (true, Some(sink)) = (retryable, &sink) {
            let requeue = {
                let mut phase = self.phase.lock();
                if matches!(*phase, Phase::Done) {
                    false
                } else {
                    *phase = Phase::Idle;
                    true
                }
            };
            if requeue {
                debug!("request {} retrying after {:?}", self.id, outcome.error);
                sink.on_retry(&me, &outcome);
                return;
            }
        }

        *self.phase.lock() = Phase::Done;
        self.deliver(response);
        if let Some(sink) = sink {
            sink.on_completed(&me, &outcome);
        }
    }
}

impl<D: Descriptor> PendingRequest for MaintainerRequest<D> {
    fn id(&self) -> u64 {
        self.id
    }

    fn needs_token(&self) -> bool {
        D::NEEDS_TOKEN
    }

    fn deadline(&self) -> Instant {
        self.deadline
    }

    fn max_retry_time(&self) -> Instant {
        self.max_retry_time
    }

    fn stamp_token(&self, token: &SessionTokenData) {
        self.descriptor.lock().stamp_token(token);
    }

    fn init(self: Arc<Self>, transport: Arc<dyn Transport>, sink: Weak<dyn CompletionSink>, handle: &Handle) {
        let token = CancellationToken::new();
        let already_done = {
            let mut phase = self.phase.lock();
            if matches!(*phase, Phase::Done) {
                true
            } else {
                *phase = Phase::InFlight(token.clone());
                false
            }
        };

        if already_done {
            // Callback already delivered; only release the bookkeeping.
            handle.spawn(async move {
                if let Some(sink) = sink.upgrade() {
                    let me: RequestRef = self.clone();
                    sink.on_completed(
                        &me,
                        &Outcome {
                            error: Some(ApiError::Cancelled),
                            new_key: false,
                        },
                    );
                }
            });
            return;
        }

        let mut call = self.descriptor.lock().to_call();
        call.timeout = Some(self.timeout);
        handle.spawn(async move {
            let result = tokio::select! {
                result = transport.send(call) => Some(result),
                _ = token.cancelled() => None,
            };
            let response = match result {
                Some(Ok(value)) => self.descriptor.lock().parse_response(value),
                Some(Err(e)) => D::Response::from_error(e),
                None => D::Response::from_error(ApiError::Cancelled),
            };
            self.complete(response, sink);
        });
    }

    fn cancel(&self) {
        self.finish_with(ApiError::Cancelled);
    }

    fn fail(&self, error: ApiError) {
        self.finish_with(error);
    }

    fn is_finished(&self) -> bool {
        self.callback.lock().is_none()
    }
}

/// Caller-side handle to a request issued through the maintainer.
#[derive(Clone)]
pub struct RequestHandle {
    request: RequestRef,
}

impl RequestHandle {
    pub(crate) fn new(request: RequestRef) -> Self {
        Self { request }
    }

    pub fn id(&self) -> u64 {
        self.request.id()
    }

    /// Deliver `ApiError::Cancelled` unless the callback already ran.
    pub fn cancel(&self) {
        self.request.cancel();
    }

    /// Deliver `error` unless the callback already ran.
    pub fn fail(&self, error: ApiError) {
        self.request.fail(error);
    }

    pub fn is_finished(&self) -> bool {
        self.request.is_finished()
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.request.id())
            .field("needs_token", &self.request.needs_token())
            .field("finished", &self.request.is_finished())
            .finish()
    }
}
