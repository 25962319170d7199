// Token pool, request queues and observable states behind one lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::callback::CallbackExecutor;
use super::request::{PendingRequest, RequestRef};
use super::stats::MaintainerStats;
use super::timed_events::{EventOutcome, TimedEvents};
use crate::api::{ConnectionState, Credentials, SessionState, SessionTokenData};
use crate::error::{ApiError, TimeoutKind};

type Observer<S> = Arc<dyn Fn(S) + Send + Sync>;
type Notification = Box<dyn FnOnce() + Send + 'static>;

/// Limits on how many tokens may exist at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLimits {
    pub max_in_flight: usize,
    pub max_tokens: usize,
}

/// Point-in-time view of the pool and queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub pooled: usize,
    pub checked_out: usize,
    pub in_flight_fetches: usize,
    pub waiting_token_requests: usize,
    pub waiting_non_token_requests: usize,
    pub in_progress_requests: usize,
}

struct LockerState {
    credentials: Option<Credentials>,
    session_state: SessionState,
    session_state_version: u32,
    connection_state: ConnectionState,
    waiting_token: VecDeque<RequestRef>,
    waiting_non_token: VecDeque<RequestRef>,
    in_progress: HashMap<u64, RequestRef>,
    checked_out: HashMap<u64, SessionTokenData>,
    /// Used as a stack: the freshest token is handed out first.
    tokens: Vec<SessionTokenData>,
    in_flight_fetches: usize,
    session_observer: Option<Observer<SessionState>>,
    connection_observer: Option<Observer<ConnectionState>>,
}

impl LockerState {
    fn change_session_state(&mut self, new_state: SessionState) -> Option<Notification> {
        if self.session_state == new_state {
            return None;
        }
        info!("session state {} -> {}", self.session_state, new_state);
        match &new_state {
            SessionState::Uninitialized => {
                self.credentials = None;
                self.purge_tokens();
            }
            SessionState::Running { .. } => {}
            _ => self.purge_tokens(),
        }
        self.session_state = new_state;
        self.session_state_version = self.session_state_version.wrapping_add(1);

        let observer = self.session_observer.clone()?;
        let state = self.session_state.clone();
        Some(Box::new(move || observer(state)))
    }

    fn change_connection_state(&mut self, new_state: ConnectionState) -> Option<Notification> {
        if self.connection_state == new_state {
            return None;
        }
        info!("connection state {} -> {}", self.connection_state, new_state);
        self.connection_state = new_state;

        let observer = self.connection_observer.clone()?;
        let state = self.connection_state.clone();
        Some(Box::new(move || observer(state)))
    }

    fn purge_tokens(&mut self) {
        if !self.tokens.is_empty() || !self.checked_out.is_empty() {
            debug!(
                "purging session tokens pooled={} checked_out={}",
                self.tokens.len(),
                self.checked_out.len()
            );
        }
        self.tokens.clear();
        self.checked_out.clear();
    }

    fn enqueue(&mut self, request: RequestRef) {
        if request.needs_token() {
            self.waiting_token.push_back(request);
        } else {
            self.waiting_non_token.push_back(request);
        }
    }
}

pub struct SessionMaintainerLocker {
    state: Mutex<LockerState>,
    limits: TokenLimits,
    callbacks: CallbackExecutor,
    stats: Arc<MaintainerStats>,
    delayed: TimedEvents<RequestRef>,
    timeouts: TimedEvents<Weak<dyn PendingRequest>>,
}

impl SessionMaintainerLocker {
    /// `on_delayed` receives requests parked by `move_in_progress_to_delayed`
    /// once their delay lapses, or with `Cancelled` when timeouts stop.
    pub fn new<F>(
        handle: &Handle,
        callbacks: CallbackExecutor,
        stats: Arc<MaintainerStats>,
        limits: TokenLimits,
        on_delayed: F,
    ) -> Arc<Self>
    where
        F: Fn(RequestRef, EventOutcome) + Send + Sync + 'static,
    {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let locker = weak.clone();
            let timeouts = TimedEvents::new(handle, move |request: Weak<dyn PendingRequest>, outcome| {
                if outcome == EventOutcome::Fired {
                    if let Some(locker) = locker.upgrade() {
                        locker.handle_timed_out_request(&request);
                    }
                }
            });
            Self {
                state: Mutex::new(LockerState {
                    credentials: None,
                    session_state: SessionState::Uninitialized,
                    session_state_version: 0,
                    connection_state: ConnectionState::Uninitialized,
                    waiting_token: VecDeque::new(),
                    waiting_non_token: VecDeque::new(),
                    in_progress: HashMap::new(),
                    checked_out: HashMap::new(),
                    tokens: Vec::new(),
                    in_flight_fetches: 0,
                    session_observer: None,
                    connection_observer: None,
                }),
                limits,
                callbacks,
                stats,
                delayed: TimedEvents::new(handle, on_delayed),
                timeouts,
            }
        })
    }

    fn notify(&self, notification: Option<Notification>) {
        if let Some(notification) = notification {
            self.callbacks.post(notification);
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.state.lock().credentials.clone()
    }

    /// Store `credentials` and move to `Initialized` when they differ from
    /// the current ones or the session is in a failure state.
    pub fn set_credentials(&self, credentials: Credentials) {
        let notification = {
            let mut state = self.state.lock();
            if state.credentials.as_ref() == Some(&credentials)
                && !state.session_state.is_failure()
            {
                return;
            }
            debug!(
                "credentials set kind={} hash={:x}",
                credentials.kind(),
                credentials.credentials_hash()
            );
            state.credentials = Some(credentials);
            state.change_session_state(SessionState::Initialized)
        };
        self.notify(notification);
    }

    /// Queue `request` and arm its timeout at `request.deadline()`.
    /// The request is queued before the timer can see it.
    pub fn add_waiting_request(&self, request: RequestRef) {
        let deadline = request.deadline();
        let timeout = Arc::downgrade(&request);
        self.state.lock().enqueue(request);
        self.timeouts.add_at(deadline, timeout);
    }

    /// Oldest waiting request that needs no token. Requests already
    /// finished while waiting are dropped.
    pub fn next_waiting_non_token_request(&self) -> Option<RequestRef> {
        let mut state = self.state.lock();
        while let Some(request) = state.waiting_non_token.pop_front() {
            if !request.is_finished() {
                return Some(request);
            }
        }
        None
    }

    /// Pair the oldest waiting token request with the freshest pooled token.
    /// The pair is registered as in progress before the lock is released.
    pub fn next_waiting_token_request(&self) -> Option<(RequestRef, SessionTokenData)> {
        let mut state = self.state.lock();
        while !state.tokens.is_empty() {
            let request = state.waiting_token.pop_front()?;
            if request.is_finished() {
                continue;
            }
            let token = state.tokens.pop()?;
            state.in_progress.insert(request.id(), Arc::clone(&request));
            state.checked_out.insert(request.id(), token.clone());
            return Some((request, token));
        }
        None
    }

    pub fn add_in_progress_request(&self, request: RequestRef) {
        self.state.lock().in_progress.insert(request.id(), request);
    }

    pub fn add_in_progress_request_with_token(&self, request: RequestRef, token: SessionTokenData) {
        let mut state = self.state.lock();
        state.checked_out.insert(request.id(), token);
        state.in_progress.insert(request.id(), request);
    }

    pub fn remove_in_progress_request(&self, request: &RequestRef) -> bool {
        self.state.lock().in_progress.remove(&request.id()).is_some()
    }

    /// Requeue an in-progress request. Its original timeout stays armed.
    pub fn move_in_progress_to_waiting(&self, request: &RequestRef) {
        let mut state = self.state.lock();
        state.in_progress.remove(&request.id());
        state.enqueue(Arc::clone(request));
    }

    /// Drop the checked-out token of `request` and requeue it for a fresh
    /// one, under one lock.
    pub fn requeue_for_fresh_token(&self, request: &RequestRef) {
        let mut state = self.state.lock();
        state.checked_out.remove(&request.id());
        state.in_progress.remove(&request.id());
        state.enqueue(Arc::clone(request));
    }

    /// Return the checked-out token of `request` to the pool and park the
    /// request for `delay`, under one lock.
    pub fn reuse_token_and_delay(&self, request: &RequestRef, new_key: bool, delay: Duration) {
        {
            let mut state = self.state.lock();
            state.in_progress.remove(&request.id());
            if let Some(mut token) = state.checked_out.remove(&request.id()) {
                if new_key {
                    token.rotate_secret_key();
                }
                state.tokens.push(token);
            }
        }
        self.delayed.add_after(delay, Arc::clone(request));
    }

    pub fn move_in_progress_to_delayed(&self, request: &RequestRef, delay: Duration) {
        self.state.lock().in_progress.remove(&request.id());
        self.delayed.add_after(delay, Arc::clone(request));
    }

    /// Grant one token fetch if the pool needs it and the limits allow.
    pub fn permit_token_checkout(&self) -> bool {
        let mut state = self.state.lock();
        state.waiting_token.retain(|request| !request.is_finished());
        let in_flight = state.in_flight_fetches;
        let pooled = state.tokens.len();
        let checked_out = state.checked_out.len();

        // Keep at least one token around at all times.
        let bootstrap = in_flight == 0 && pooled + checked_out == 0;
        // Checked-out tokens are not counted against demand so that
        // concurrency can grow up to the token ceiling.
        let demand = state.waiting_token.len() > in_flight + pooled
            && in_flight < self.limits.max_in_flight
            && in_flight + pooled + checked_out < self.limits.max_tokens;

        if bootstrap || demand {
            state.in_flight_fetches += 1;
            true
        } else {
            false
        }
    }

    pub fn decrement_token_fetch_count(&self) {
        let mut state = self.state.lock();
        state.in_flight_fetches = state.in_flight_fetches.saturating_sub(1);
    }

    /// Pool `token` if it was minted with the current credentials.
    pub fn add_token(&self, token: SessionTokenData, fetched_with: &Credentials) -> bool {
        let mut state = self.state.lock();
        if state.credentials.as_ref() == Some(fetched_with) {
            state.tokens.push(token);
            true
        } else {
            debug!("discarding session token minted with stale credentials");
            false
        }
    }

    /// Return `request`'s checked-out token to the pool, rotating its secret
    /// key first when the server asked for a new key.
    pub fn reuse_token(&self, request: &RequestRef, new_key: bool) {
        if !request.needs_token() {
            return;
        }
        let mut state = self.state.lock();
        if let Some(mut token) = state.checked_out.remove(&request.id()) {
            if new_key {
                token.rotate_secret_key();
            }
            state.tokens.push(token);
        }
    }

    pub fn delete_checked_out_token(&self, request: &RequestRef) {
        self.state.lock().checked_out.remove(&request.id());
    }

    /// Fail `request` with the queue-specific timeout if it is still waiting.
    pub fn handle_timed_out_request(&self, request: &Weak<dyn PendingRequest>) {
        let Some(request) = request.upgrade() else {
            return;
        };
        let removed = {
            let mut state = self.state.lock();
            let queue = if request.needs_token() {
                &mut state.waiting_token
            } else {
                &mut state.waiting_non_token
            };
            match queue.iter().position(|r| r.id() == request.id()) {
                Some(index) => queue.remove(index).is_some(),
                None => false,
            }
        };
        if removed {
            let kind = if request.needs_token() {
                TimeoutKind::SessionTokenUnavailable
            } else {
                TimeoutKind::ConnectionUnavailable
            };
            warn!("request {} timed out waiting ({:?})", request.id(), kind);
            self.stats.record_timeout();
            request.fail(ApiError::Timeout(kind));
        }
    }

    /// Requests waiting, delayed or in progress.
    pub fn total_requests(&self) -> usize {
        let queued = {
            let state = self.state.lock();
            state.waiting_token.len() + state.waiting_non_token.len() + state.in_progress.len()
        };
        queued + self.delayed.size()
    }

    pub fn token_counts(&self) -> TokenCounts {
        let state = self.state.lock();
        TokenCounts {
            pooled: state.tokens.len(),
            checked_out: state.checked_out.len(),
            in_flight_fetches: state.in_flight_fetches,
            waiting_token_requests: state.waiting_token.len(),
            waiting_non_token_requests: state.waiting_non_token.len(),
            in_progress_requests: state.in_progress.len(),
        }
    }

    /// Current session state and its version for `set_session_state_safe`.
    pub fn session_state(&self) -> (SessionState, u32) {
        let state = self.state.lock();
        (state.session_state.clone(), state.session_state_version)
    }

    pub fn set_session_state(&self, new_state: SessionState) {
        let notification = self.state.lock().change_session_state(new_state);
        self.notify(notification);
    }

    /// Transition only if nobody changed the state since `expected_version`
    /// was read.
    pub fn set_session_state_safe(&self, new_state: SessionState, expected_version: u32) -> bool {
        let notification = {
            let mut state = self.state.lock();
            if state.session_state_version != expected_version {
                return false;
            }
            state.change_session_state(new_state)
        };
        self.notify(notification);
        true
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection_state.clone()
    }

    pub fn set_connection_state(&self, new_state: ConnectionState) {
        let notification = self.state.lock().change_connection_state(new_state);
        self.notify(notification);
    }

    pub fn set_session_state_change_callback<F>(&self, callback: F)
    where
        F: Fn(SessionState) + Send + Sync + 'static,
    {
        self.state.lock().session_observer = Some(Arc::new(callback));
    }

    pub fn set_connection_state_change_callback<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.state.lock().connection_observer = Some(Arc::new(callback));
    }

    /// Stop both timers. Delayed requests are cancelled; waiting requests
    /// no longer time out.
    pub fn stop_timeouts(&self) {
        self.delayed.stop();
        self.timeouts.stop();
    }

    /// Cancel every waiting, delayed and in-progress request.
    pub fn cancel_all(&self) {
        let requests: Vec<RequestRef> = {
            let mut state = self.state.lock();
            let mut requests: Vec<RequestRef> = state.waiting_token.drain(..).collect();
            requests.extend(state.waiting_non_token.drain(..));
            requests.extend(state.in_progress.drain().map(|(_, r)| r));
            state.checked_out.clear();
            requests
        };
        if !requests.is_empty() {
            info!("cancelling {} outstanding requests", requests.len());
        }
        for request in requests {
            request.cancel();
        }
        self.delayed.cancel_all();
    }
}

impl Drop for SessionMaintainerLocker {
    fn drop(&mut self) {
        self.stop_timeouts();
        self.cancel_all();
    }
}
