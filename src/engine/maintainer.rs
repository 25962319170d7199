// Session maintainer: dispatches queued calls, mints tokens and tracks session health.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::callback::CallbackExecutor;
use super::locker::{SessionMaintainerLocker, TokenCounts, TokenLimits};
use super::request::{CompletionSink, MaintainerRequest, Outcome, RequestHandle, RequestRef};
use super::stats::{MaintainerStats, StatsSnapshot};
use super::timed_events::EventOutcome;
use crate::api::{
    ApiResponse, ConnectionState, Credentials, Descriptor, SessionState, SessionTokenResponse,
};
use crate::config::MaintainerConfig;
use crate::error::{ApiError, TransportErrorKind};
use crate::transport::Transport;

#[derive(Default)]
struct TokenBackoff {
    consecutive_failures: u32,
    hold_until: Option<Instant>,
}

struct MaintainerInner {
    locker: Arc<SessionMaintainerLocker>,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    callbacks: CallbackExecutor,
    config: MaintainerConfig,
    timeout_seconds: AtomicU32,
    backoff: Mutex<TokenBackoff>,
    probe_in_flight: AtomicBool,
    recheck_armed: AtomicBool,
    stats: Arc<MaintainerStats>,
    this: Weak<MaintainerInner>,
}

/// Front door for API calls. Queues each call, supplies session tokens to
/// the ones that need them and retries token failures within the call's
/// timeout. Every call's callback runs exactly once.
///
/// Dropping the maintainer cancels every outstanding call.
pub struct SessionMaintainer {
    inner: Arc<MaintainerInner>,
}

impl SessionMaintainer {
    /// Create a maintainer on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: MaintainerConfig) -> Self {
        Self::with_runtime(transport, config, Handle::current())
    }

    pub fn with_runtime(
        transport: Arc<dyn Transport>,
        config: MaintainerConfig,
        runtime: Handle,
    ) -> Self {
        let callbacks = CallbackExecutor::spawn(&runtime);
        let stats = Arc::new(MaintainerStats::new());
        let limits = TokenLimits {
            max_in_flight: config.max_in_flight_token_requests,
            max_tokens: config.max_tokens,
        };

        let inner = Arc::new_cyclic(|this: &Weak<MaintainerInner>| {
            let owner = this.clone();
            let locker = SessionMaintainerLocker::new(
                &runtime,
                callbacks.clone(),
                Arc::clone(&stats),
                limits,
                move |request: RequestRef, outcome| match (outcome, owner.upgrade()) {
                    (EventOutcome::Fired, Some(inner)) => inner.add_waiting_request(request),
                    _ => request.cancel(),
                },
            );
            MaintainerInner {
                locker,
                transport,
                runtime: runtime.clone(),
                callbacks: callbacks.clone(),
                timeout_seconds: AtomicU32::new(config.timeout_seconds),
                config,
                backoff: Mutex::new(TokenBackoff::default()),
                probe_in_flight: AtomicBool::new(false),
                recheck_armed: AtomicBool::new(false),
                stats,
                this: this.clone(),
            }
        });

        Self { inner }
    }

    /// Queue `descriptor`; `callback` runs on the maintainer's callback executor.
    pub fn call<D, F>(&self, descriptor: D, callback: F) -> RequestHandle
    where
        D: Descriptor,
        F: FnOnce(D::Response) + Send + 'static,
    {
        self.call_on(descriptor, callback, &self.inner.callbacks)
    }

    /// Queue `descriptor`; `callback` runs on `executor`.
    pub fn call_on<D, F>(
        &self,
        descriptor: D,
        callback: F,
        executor: &CallbackExecutor,
    ) -> RequestHandle
    where
        D: Descriptor,
        F: FnOnce(D::Response) + Send + 'static,
    {
        let timeout = Duration::from_secs(u64::from(
            self.inner.timeout_seconds.load(Ordering::Relaxed),
        ));
        let request: RequestRef =
            MaintainerRequest::new(descriptor, callback, executor.clone(), timeout);
        self.inner.add_waiting_request(Arc::clone(&request));
        RequestHandle::new(request)
    }

    pub async fn call_async<D: Descriptor>(&self, descriptor: D) -> D::Response {
        let (tx, rx) = oneshot::channel();
        self.call(descriptor, move |response| {
            let _ = tx.send(response);
        });
        rx.await
            .unwrap_or_else(|_| D::Response::from_error(ApiError::Cancelled))
    }

    /// Replace the login credentials. The session restarts from scratch:
    /// pooled tokens are dropped and any backoff is cleared.
    pub fn set_login_credentials(&self, credentials: Credentials) {
        info!("login credentials updated kind={}", credentials.kind());
        let inner = &self.inner;
        inner.locker.set_session_state(SessionState::Uninitialized);
        inner.locker.set_credentials(credentials);
        *inner.backoff.lock() = TokenBackoff::default();
        inner.attempt_requests();
    }

    /// Timeout and retry budget for calls issued from now on.
    pub fn set_timeout_seconds(&self, seconds: u32) {
        self.inner.timeout_seconds.store(seconds, Ordering::Relaxed);
    }

    pub fn timeout_seconds(&self) -> u32 {
        self.inner.timeout_seconds.load(Ordering::Relaxed)
    }

    /// Stop request timeouts and delayed retries. Used before shutdown.
    pub fn stop_timeouts(&self) {
        self.inner.locker.stop_timeouts();
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.locker.session_state().0
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.locker.connection_state()
    }

    pub fn set_session_state_change_callback<F>(&self, callback: F)
    where
        F: Fn(SessionState) + Send + Sync + 'static,
    {
        self.inner.locker.set_session_state_change_callback(callback);
    }

    pub fn set_connection_state_change_callback<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner
            .locker
            .set_connection_state_change_callback(callback);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn token_counts(&self) -> TokenCounts {
        self.inner.locker.token_counts()
    }

    pub fn total_requests(&self) -> usize {
        self.inner.locker.total_requests()
    }

    /// Executor that runs callbacks of `call`.
    pub fn callbacks(&self) -> &CallbackExecutor {
        &self.inner.callbacks
    }
}

impl Drop for SessionMaintainer {
    fn drop(&mut self) {
        self.inner.locker.stop_timeouts();
        self.inner.locker.cancel_all();
    }
}

impl MaintainerInner {
    fn sink(&self) -> Weak<dyn CompletionSink> {
        self.this.clone()
    }

    fn add_waiting_request(&self, request: RequestRef) {
        self.locker.add_waiting_request(request);
        self.attempt_requests();
    }

    /// Dispatch whatever can go out now and top up the token pool.
    fn attempt_requests(&self) {
        if self.locker.connection_state().is_unconnected() {
            self.start_connection_probe();
            return;
        }

        while let Some(request) = self.locker.next_waiting_non_token_request() {
            self.locker.add_in_progress_request(Arc::clone(&request));
            self.dispatch(request);
        }

        while self.locker.session_state().0.is_running() {
            let Some((request, token)) = self.locker.next_waiting_token_request() else {
                break;
            };
            request.stamp_token(&token);
            self.dispatch(request);
        }

        let Some(credentials) = self.locker.credentials() else {
            return;
        };
        if self.token_fetch_held_off() {
            return;
        }
        while self.locker.permit_token_checkout() {
            self.request_session_token(credentials.clone());
        }
    }

    fn dispatch(&self, request: RequestRef) {
        debug!(
            "dispatching request {} needs_token={}",
            request.id(),
            request.needs_token()
        );
        self.stats.record_dispatched();
        request.init(Arc::clone(&self.transport), self.sink(), &self.runtime);
    }

    fn token_fetch_held_off(&self) -> bool {
        let mut backoff = self.backoff.lock();
        match backoff.hold_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                backoff.hold_until = None;
                false
            }
            None => false,
        }
    }

    /// Block token fetches for `wait`, then run the dispatch loop again.
    fn hold_off_token_fetches(&self, wait: Duration) {
        let until = Instant::now() + wait;
        {
            let mut backoff = self.backoff.lock();
            backoff.hold_until = Some(backoff.hold_until.map_or(until, |current| current.max(until)));
        }
        let this = self.this.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep_until(until).await;
            if let Some(inner) = this.upgrade() {
                inner.attempt_requests();
            }
        });
    }

    fn request_session_token(&self, credentials: Credentials) {
        debug!("requesting session token kind={}", credentials.kind());
        self.stats.record_token_fetch();
        let this = self.this.clone();
        let transport = Arc::clone(&self.transport);
        let timeout = self.config.token_fetch_timeout();
        self.runtime.spawn(async move {
            let response =
                match tokio::time::timeout(timeout, transport.fetch_session_token(&credentials))
                    .await
                {
                    Ok(response) => response,
                    Err(_) => SessionTokenResponse::from_error(ApiError::transport(
                        TransportErrorKind::IoTimeout,
                        "session token request timed out",
                    )),
                };
            match this.upgrade() {
                Some(inner) => inner.handle_session_token_response(response, &credentials),
                None => debug!("session token response after shutdown ignored"),
            }
        });
    }

    fn handle_session_token_response(
        &self,
        response: SessionTokenResponse,
        fetched_with: &Credentials,
    ) {
        self.locker.decrement_token_fetch_count();
        let (state, version) = self.locker.session_state();
        self.update_connection_state(response.error.as_ref());

        let Some(error) = response.error.clone() else {
            if self.locker.add_token(response.token_data(), fetched_with) {
                self.backoff.lock().consecutive_failures = 0;
                if !state.is_running() {
                    self.locker.set_session_state_safe(
                        SessionState::Running {
                            last_response: response,
                        },
                        version,
                    );
                }
            }
            self.attempt_requests();
            return;
        };

        self.stats.record_token_failure();
        let current = self.locker.credentials().as_ref() == Some(fetched_with);
        warn!("session token request failed: {}", error);

        let wait = match &error {
            ApiError::InvalidCredentials { .. } => {
                if current && !state.is_failure() {
                    let pkey = Some(response.pkey.clone()).filter(|pkey| !pkey.is_empty());
                    self.locker.set_session_state_safe(
                        SessionState::CredentialsFailure {
                            pkey,
                            error: error.clone(),
                            last_response: response,
                        },
                        version,
                    );
                }
                self.config.credential_failure_wait()
            }
            ApiError::AccountTemporarilyLocked { .. } => {
                if current {
                    self.locker.set_session_state_safe(
                        SessionState::ProlongedError {
                            error: error.clone(),
                            last_response: response,
                        },
                        version,
                    );
                }
                self.config.account_locked_wait()
            }
            _ => {
                let failures = {
                    let mut backoff = self.backoff.lock();
                    backoff.consecutive_failures += 1;
                    backoff.consecutive_failures
                };
                if current && failures >= self.config.prolonged_failure_threshold {
                    self.locker.set_session_state_safe(
                        SessionState::ProlongedError {
                            error: error.clone(),
                            last_response: response,
                        },
                        version,
                    );
                }
                self.config.token_failure_wait()
            }
        };
        self.hold_off_token_fetches(wait);
    }

    /// Track reachability from the outcome of any round trip.
    fn update_connection_state(&self, error: Option<&ApiError>) {
        match error {
            Some(error) if error.is_connection_failure() => {
                self.locker.set_connection_state(ConnectionState::Unconnected {
                    error: error.clone(),
                });
                self.arm_connection_recheck();
            }
            _ => self.locker.set_connection_state(ConnectionState::Connected),
        }
    }

    fn arm_connection_recheck(&self) {
        if self.recheck_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.this.clone();
        let wait = self.config.connection_recheck();
        self.runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(inner) = this.upgrade() {
                inner.recheck_armed.store(false, Ordering::SeqCst);
                inner.attempt_requests();
            }
        });
    }

    fn start_connection_probe(&self) {
        if self.probe_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("probing connection");
        let this = self.this.clone();
        let transport = Arc::clone(&self.transport);
        let timeout = self.config.token_fetch_timeout();
        self.runtime.spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.check_status()).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::transport(
                    TransportErrorKind::IoTimeout,
                    "status check timed out",
                )),
            };
            let Some(inner) = this.upgrade() else {
                return;
            };
            inner.probe_in_flight.store(false, Ordering::SeqCst);
            inner.update_connection_state(result.as_ref().err());
            if !inner.locker.connection_state().is_unconnected() {
                inner.attempt_requests();
            }
        });
    }
}

impl CompletionSink for MaintainerInner {
    fn on_completion_notification(&self, error: Option<&ApiError>) {
        self.update_connection_state(error);
    }

    fn on_completed(&self, request: &RequestRef, outcome: &Outcome) {
        self.locker.remove_in_progress_request(request);
        self.stats.record_returned(true);
        if outcome
            .error
            .as_ref()
            .is_some_and(ApiError::is_invalid_session_token)
        {
            self.locker.delete_checked_out_token(request);
        } else {
            self.locker.reuse_token(request, outcome.new_key);
        }
        self.attempt_requests();
    }

    fn on_retry(&self, request: &RequestRef, outcome: &Outcome) {
        self.stats.record_retry();
        self.stats.record_returned(false);
        if outcome
            .error
            .as_ref()
            .is_some_and(ApiError::is_invalid_session_token)
        {
            self.locker.requeue_for_fresh_token(request);
        } else {
            self.locker.reuse_token_and_delay(
                request,
                outcome.new_key,
                self.config.in_progress_retry(),
            );
        }
        self.attempt_requests();
    }
}
