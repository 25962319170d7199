use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use cloud_api_engine::api::{
    ApiResponse, ConnectionState, Credentials, JsonResponse, SessionCall, SessionState,
    SessionTokenResponse, TokenlessCall,
};
use cloud_api_engine::config::MaintainerConfig;
use cloud_api_engine::engine::SessionMaintainer;
use cloud_api_engine::error::{ApiError, TimeoutKind, TransportErrorKind};
use cloud_api_engine::transport::{ApiCall, Transport};

/// In-memory server: mints numbered tokens and replays scripted answers.
#[derive(Default)]
struct FakeTransport {
    fetches: AtomicUsize,
    sends: AtomicUsize,
    sent_tokens: Mutex<Vec<Option<String>>>,
    send_script: Mutex<VecDeque<Result<Value, ApiError>>>,
    fetch_failure: Mutex<Option<ApiError>>,
    status_failure: Mutex<Option<ApiError>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_send(&self, result: Result<Value, ApiError>) {
        self.send_script.lock().push_back(result);
    }

    fn fail_fetches(&self, error: Option<ApiError>) {
        *self.fetch_failure.lock() = error;
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, call: ApiCall) -> Result<Value, ApiError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.sent_tokens
            .lock()
            .push(call.session.map(|t| t.session_token));
        let scripted = self.send_script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(json!({ "result": "Success", "path": call.path })))
    }

    async fn fetch_session_token(&self, _credentials: &Credentials) -> SessionTokenResponse {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.fetch_failure.lock().clone() {
            return SessionTokenResponse {
                pkey: "pk".to_string(),
                ..SessionTokenResponse::from_error(error)
            };
        }
        SessionTokenResponse {
            session_token: format!("tok-{}", n),
            pkey: "pk".to_string(),
            time: "0".to_string(),
            secret_key: 42,
            ekey: None,
            error: None,
        }
    }

    async fn check_status(&self) -> Result<(), ApiError> {
        match self.status_failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn creds() -> Credentials {
    Credentials::email("user@example.com", "pw")
}

fn maintainer(transport: &Arc<FakeTransport>, config: MaintainerConfig) -> SessionMaintainer {
    cloud_api_engine::logging::init_tracing();
    let transport: Arc<dyn Transport> = transport.clone();
    SessionMaintainer::new(transport, config)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn counting_call(
    maintainer: &SessionMaintainer,
    call: SessionCall,
    calls: &Arc<AtomicUsize>,
) -> oneshot::Receiver<JsonResponse> {
    let (tx, rx) = oneshot::channel();
    let calls = Arc::clone(calls);
    maintainer.call(call, move |response| {
        calls.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(response);
    });
    rx
}

#[tokio::test]
async fn test_token_call_fetches_token_before_dispatch() {
    let transport = FakeTransport::new();
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    maintainer.set_login_credentials(creds());

    let response = maintainer
        .call_async(SessionCall::new("/api/user/get_info.php"))
        .await;
    assert!(response.error.is_none());
    assert_eq!(transport.fetches(), 1);
    assert_eq!(*transport.sent_tokens.lock(), vec![Some("tok-1".to_string())]);
    assert!(maintainer.session_state().is_running());

    wait_for(|| maintainer.token_counts().pooled == 1).await;
    let counts = maintainer.token_counts();
    assert_eq!(counts.checked_out, 0);
    assert_eq!(counts.in_progress_requests, 0);
}

#[tokio::test]
async fn test_rerunning_dispatch_sends_nothing_twice() {
    let transport = FakeTransport::new();
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    maintainer.set_login_credentials(creds());

    let response = maintainer
        .call_async(SessionCall::new("/api/user/get_info.php"))
        .await;
    assert!(response.error.is_none());
    wait_for(|| maintainer.token_counts().pooled == 1).await;
    assert_eq!((transport.fetches(), transport.sends()), (1, 1));

    // Each tokenless round trip reruns the dispatch loop with nothing queued.
    for _ in 0..3 {
        let response = maintainer
            .call_async(TokenlessCall::new("/api/system/get_status.php"))
            .await;
        assert!(response.error.is_none());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.fetches(), 1);
    assert_eq!(transport.sends(), 4);
    assert_eq!(
        *transport.sent_tokens.lock(),
        vec![Some("tok-1".to_string()), None, None, None]
    );
    let counts = maintainer.token_counts();
    assert_eq!(counts.pooled, 1);
    assert_eq!(counts.in_flight_fetches, 0);
    assert_eq!(counts.in_progress_requests, 0);
    assert_eq!(maintainer.stats().dispatched, 4);
}

#[tokio::test]
async fn test_invalid_token_retries_with_fresh_token() {
    let transport = FakeTransport::new();
    transport.script_send(Err(ApiError::from_result_code(105, "expired")));
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    maintainer.set_login_credentials(creds());

    let calls = Arc::new(AtomicUsize::new(0));
    let rx = counting_call(&maintainer, SessionCall::new("/api/user/get_info.php"), &calls);
    let response = rx.await.unwrap();

    assert!(response.error.is_none());
    assert_eq!(transport.fetches(), 2);
    assert_eq!(transport.sends(), 2);
    assert_eq!(
        *transport.sent_tokens.lock(),
        vec![Some("tok-1".to_string()), Some("tok-2".to_string())]
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(maintainer.stats().retries, 1);
}

#[tokio::test]
async fn test_in_progress_retry_reuses_token_after_delay() {
    let transport = FakeTransport::new();
    transport.script_send(Err(ApiError::from_result_code(208, "busy")));
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    maintainer.set_login_credentials(creds());

    let response = maintainer
        .call_async(SessionCall::new("/api/folder/move.php"))
        .await;
    assert!(response.error.is_none());
    assert_eq!(transport.fetches(), 1);
    assert_eq!(
        *transport.sent_tokens.lock(),
        vec![Some("tok-1".to_string()), Some("tok-1".to_string())]
    );
}

#[tokio::test]
async fn test_non_retryable_error_reaches_callback() {
    let transport = FakeTransport::new();
    transport.script_send(Err(ApiError::from_result_code(110, "not found")));
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    maintainer.set_login_credentials(creds());

    let response = maintainer
        .call_async(SessionCall::new("/api/file/get_info.php"))
        .await;
    assert_eq!(
        response.error,
        Some(ApiError::Api {
            code: 110,
            message: "not found".to_string()
        })
    );
    assert_eq!(transport.sends(), 1);
}

#[tokio::test]
async fn test_tokenless_call_without_credentials() {
    let transport = FakeTransport::new();
    let maintainer = maintainer(&transport, MaintainerConfig::default());

    let response = maintainer
        .call_async(TokenlessCall::new("/api/system/get_info.php"))
        .await;
    assert!(response.error.is_none());
    assert_eq!(response.value["path"], "/api/system/get_info.php");
    assert_eq!(transport.fetches(), 0);
    assert_eq!(*transport.sent_tokens.lock(), vec![None]);
    assert_eq!(maintainer.session_state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn test_token_call_times_out_without_credentials() {
    let transport = FakeTransport::new();
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    maintainer.set_timeout_seconds(1);

    let response = maintainer
        .call_async(SessionCall::new("/api/user/get_info.php"))
        .await;
    assert_eq!(
        response.error,
        Some(ApiError::Timeout(TimeoutKind::SessionTokenUnavailable))
    );
    assert_eq!(transport.sends(), 0);
    assert_eq!(maintainer.total_requests(), 0);
}

#[tokio::test]
async fn test_bad_credentials_enter_credentials_failure() {
    let transport = FakeTransport::new();
    transport.fail_fetches(Some(ApiError::from_result_code(107, "bad password")));
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    maintainer.set_session_state_change_callback(move |state| {
        let _ = tx.send(state);
    });
    maintainer.set_login_credentials(creds());

    assert_eq!(rx.recv().await, Some(SessionState::Initialized));
    let state = rx.recv().await.unwrap();
    match state {
        SessionState::CredentialsFailure { pkey, error, .. } => {
            assert_eq!(pkey.as_deref(), Some("pk"));
            assert!(error.is_invalid_credentials());
        }
        other => panic!("unexpected state {other}"),
    }
    assert_eq!(maintainer.token_counts().pooled, 0);
}

#[tokio::test]
async fn test_new_credentials_recover_from_failure() {
    let transport = FakeTransport::new();
    transport.fail_fetches(Some(ApiError::from_result_code(107, "bad password")));
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    maintainer.set_login_credentials(Credentials::email("user@example.com", "wrong"));
    wait_for(|| maintainer.session_state().is_failure()).await;

    transport.fail_fetches(None);
    maintainer.set_login_credentials(creds());
    let response = maintainer
        .call_async(SessionCall::new("/api/user/get_info.php"))
        .await;
    assert!(response.error.is_none());
    assert!(maintainer.session_state().is_running());
}

#[tokio::test]
async fn test_prolonged_error_after_repeated_failures() {
    let transport = FakeTransport::new();
    transport.fail_fetches(Some(ApiError::from_result_code(900, "internal error")));
    let config = MaintainerConfig {
        prolonged_failure_threshold: 3,
        token_failure_wait_ms: 10,
        ..MaintainerConfig::default()
    };
    let maintainer = maintainer(&transport, config);
    maintainer.set_login_credentials(creds());

    wait_for(|| {
        matches!(
            maintainer.session_state(),
            SessionState::ProlongedError { .. }
        )
    })
    .await;
    assert!(transport.fetches() >= 3);

    transport.fail_fetches(None);
    wait_for(|| maintainer.session_state().is_running()).await;
    assert!(maintainer.stats().token_failures >= 3);
}

#[tokio::test]
async fn test_account_locked_is_prolonged_immediately() {
    let transport = FakeTransport::new();
    transport.fail_fetches(Some(ApiError::from_result_code(243, "locked")));
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    maintainer.set_login_credentials(creds());

    wait_for(|| {
        matches!(
            maintainer.session_state(),
            SessionState::ProlongedError {
                error: ApiError::AccountTemporarilyLocked { .. },
                ..
            }
        )
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.fetches(), 1);
}

#[tokio::test]
async fn test_connection_failure_and_recovery() {
    let transport = FakeTransport::new();
    transport.script_send(Err(ApiError::transport(
        TransportErrorKind::UnableToConnect,
        "connection refused",
    )));
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    maintainer.set_connection_state_change_callback(move |state| {
        let _ = tx.send(state);
    });

    let response = maintainer
        .call_async(TokenlessCall::new("/api/system/get_info.php"))
        .await;
    assert!(response.error.as_ref().is_some_and(ApiError::is_connection_failure));

    let first = rx.recv().await.unwrap();
    assert!(first.is_unconnected());
    assert_eq!(rx.recv().await, Some(ConnectionState::Connected));
}

#[tokio::test]
async fn test_unconnected_holds_requests_until_probe_succeeds() {
    let transport = FakeTransport::new();
    let refused = ApiError::transport(TransportErrorKind::UnableToConnect, "refused");
    transport.script_send(Err(refused.clone()));
    *transport.status_failure.lock() = Some(refused);
    let config = MaintainerConfig {
        connection_recheck_ms: 50,
        ..MaintainerConfig::default()
    };
    let maintainer = maintainer(&transport, config);

    let first = maintainer
        .call_async(TokenlessCall::new("/api/system/get_info.php"))
        .await;
    assert!(first.error.is_some());
    assert!(maintainer.connection_state().is_unconnected());

    let (tx, rx) = oneshot::channel();
    maintainer.call(TokenlessCall::new("/api/system/get_info.php"), move |r| {
        let _ = tx.send(r);
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.sends(), 1);

    *transport.status_failure.lock() = None;
    let second = rx.await.unwrap();
    assert!(second.error.is_none());
    assert_eq!(maintainer.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_cancel_waiting_request() {
    let transport = FakeTransport::new();
    let maintainer = maintainer(&transport, MaintainerConfig::default());

    let (tx, rx) = oneshot::channel();
    let handle = maintainer.call(SessionCall::new("/api/user/get_info.php"), move |r| {
        let _ = tx.send(r);
    });
    handle.cancel();
    let response = rx.await.unwrap();
    assert_eq!(response.error, Some(ApiError::Cancelled));
    assert!(handle.is_finished());

    // A second cancel or fail must not produce another callback.
    handle.fail(ApiError::InvalidContent("late".to_string()));
}

#[tokio::test]
async fn test_drop_cancels_outstanding_requests() {
    let transport = FakeTransport::new();
    let maintainer = maintainer(&transport, MaintainerConfig::default());

    let (tx, rx) = oneshot::channel();
    maintainer.call(SessionCall::new("/api/user/get_info.php"), move |r| {
        let _ = tx.send(r);
    });
    drop(maintainer);

    let response = rx.await.unwrap();
    assert_eq!(response.error(), Some(&ApiError::Cancelled));
}

#[tokio::test]
async fn test_session_observer_sees_running() {
    let transport = FakeTransport::new();
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    maintainer.set_session_state_change_callback(move |state| {
        let _ = tx.send(state);
    });
    maintainer.set_login_credentials(creds());

    assert_eq!(rx.recv().await, Some(SessionState::Initialized));
    match rx.recv().await {
        Some(SessionState::Running { last_response }) => {
            assert_eq!(last_response.session_token, "tok-1");
        }
        other => panic!("unexpected state {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_calls_respect_token_limits() {
    let transport = FakeTransport::new();
    let maintainer = maintainer(&transport, MaintainerConfig::default());
    maintainer.set_login_credentials(creds());

    let calls = Arc::new(AtomicUsize::new(0));
    let receivers: Vec<_> = (0..30)
        .map(|i| {
            counting_call(
                &maintainer,
                SessionCall::new("/api/file/get_info.php").param("quick_key", format!("k{i}")),
                &calls,
            )
        })
        .collect();

    let counts = maintainer.token_counts();
    assert!(counts.in_flight_fetches <= 4);
    assert!(counts.in_flight_fetches + counts.pooled + counts.checked_out <= 10);

    for rx in receivers {
        assert!(rx.await.unwrap().error.is_none());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 30);
    assert!(transport.fetches() <= 10);
    assert_eq!(transport.sends(), 30);
}
