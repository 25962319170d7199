use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::{Credentials, SessionTokenData, SessionTokenResponse};
use crate::error::ApiError;

/// One outgoing API request, independent of how it is put on the wire.
#[derive(Debug, Clone, Default)]
pub struct ApiCall {
    /// Path of the endpoint relative to the API base url.
    pub path: String,
    pub params: Vec<(String, String)>,
    /// Token to sign the call with, when the endpoint needs one.
    pub session: Option<SessionTokenData>,
    pub timeout: Option<Duration>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform `call` and return the decoded `response` object. Server-side
    /// error codes come back as the matching `ApiError`.
    async fn send(&self, call: ApiCall) -> Result<Value, ApiError>;

    /// Mint a fresh session token for `credentials`. Failures are reported in
    /// the response's `error` field.
    async fn fetch_session_token(&self, credentials: &Credentials) -> SessionTokenResponse;

    /// Cheap reachability check used while the connection is down.
    async fn check_status(&self) -> Result<(), ApiError> {
        Ok(())
    }
}
