use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::{debug, warn};

use super::traits::{ApiCall, Transport};
use crate::api::{ApiResponse, Credentials, SessionTokenData, SessionTokenResponse};
use crate::error::{ApiError, TransportErrorKind};

const SESSION_TOKEN_PATH: &str = "/api/1.3/user/get_session_token.php";
const STATUS_PATH: &str = "/api/system/get_status.php";
const TOKEN_VERSION: &str = "2";

/// Produces the `signature` parameter for outgoing calls.
pub trait RequestSigner: Send + Sync {
    /// Signature for a token-bearing call, or `None` to send it unsigned.
    fn sign_call(
        &self,
        _path: &str,
        _params: &[(String, String)],
        _token: &SessionTokenData,
    ) -> Option<String> {
        None
    }

    /// Extra parameters (application id, signature) for a token fetch.
    fn sign_login(&self, _credentials: &Credentials) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Sends every call without a signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsignedRequests;

impl RequestSigner for UnsignedRequests {}

pub struct HttpTransport {
    client: Client,
    base_url: Url,
    signer: Arc<dyn RequestSigner>,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_signer(base_url, Arc::new(UnsignedRequests))
    }

    pub fn with_signer(base_url: &str, signer: Arc<dyn RequestSigner>) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| anyhow!("invalid api base url {}: {}", base_url, e))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("api base url {} cannot be a base", base_url));
        }
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url,
            signer,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::transport(TransportErrorKind::InvalidUrl, e.to_string()))
    }

    async fn get(
        &self,
        path: &str,
        params: &[(String, String)],
        timeout: Option<Duration>,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(path)?;
        let mut req = self
            .client
            .get(url)
            .query(params)
            .query(&[("response_format", "json")]);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await.map_err(classify_reqwest_error)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(classify_reqwest_error)?;
        debug!("api call path={} status={} bytes={}", path, status.as_u16(), body.len());

        // Error envelopes often arrive with a non-2xx status, so decode first.
        match serde_json::from_slice::<Value>(&body) {
            Ok(document) => decode_envelope(document),
            Err(e) if status.is_success() => Err(ApiError::InvalidContent(format!(
                "response is not json: {}",
                e
            ))),
            Err(_) => {
                warn!("api call path={} failed status={}", path, status.as_u16());
                Err(ApiError::transport(
                    TransportErrorKind::HttpStatus(status.as_u16()),
                    format!("HTTP {}", status.as_u16()),
                ))
            }
        }
    }
}

/// Unwrap `{"response": {...}}`, mapping `result == "Error"` to its `ApiError`.
pub fn decode_envelope(document: Value) -> Result<Value, ApiError> {
    let response = match document {
        Value::Object(mut map) => match map.remove("response") {
            Some(response @ Value::Object(_)) => response,
            _ => {
                return Err(ApiError::InvalidContent(
                    "missing \"response\" object".to_string(),
                ))
            }
        },
        _ => {
            return Err(ApiError::InvalidContent(
                "response document is not an object".to_string(),
            ))
        }
    };

    let result = response.get("result").and_then(Value::as_str).unwrap_or("");
    if result.eq_ignore_ascii_case("error") {
        let code = match response.get("error") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse::<i64>().ok(),
            _ => None,
        };
        let message = response
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        return match code.and_then(|c| i32::try_from(c).ok()) {
            Some(code) => Err(ApiError::from_result_code(code, message)),
            None => Err(ApiError::InvalidContent(format!(
                "error response without code: {}",
                message
            ))),
        };
    }
    Ok(response)
}

fn classify_reqwest_error(e: reqwest::Error) -> ApiError {
    let chain = error_chain_text(&e);
    let kind = if e.is_timeout() {
        TransportErrorKind::IoTimeout
    } else if e.is_builder() {
        TransportErrorKind::InvalidUrl
    } else if e.is_connect() {
        if chain.contains("dns") || chain.contains("resolve") || chain.contains("lookup") {
            TransportErrorKind::UnableToResolve
        } else if chain.contains("tls")
            || chain.contains("certificate")
            || chain.contains("handshake")
        {
            TransportErrorKind::SslHandshakeFailure
        } else if chain.contains("proxy") {
            TransportErrorKind::UnableToConnectToProxy
        } else {
            TransportErrorKind::UnableToConnect
        }
    } else if e.is_body() || e.is_decode() {
        TransportErrorKind::ReadFailure
    } else if e.is_request() {
        TransportErrorKind::WriteFailure
    } else if let Some(status) = e.status() {
        TransportErrorKind::HttpStatus(status.as_u16())
    } else {
        TransportErrorKind::Other
    };
    ApiError::transport(kind, chain)
}

fn error_chain_text(e: &reqwest::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text.to_lowercase()
}

fn login_params(credentials: &Credentials) -> Vec<(String, String)> {
    let mut params = match credentials {
        Credentials::Email { email, password } => vec![
            ("email".to_string(), email.clone()),
            ("password".to_string(), password.clone()),
        ],
        Credentials::Ekey { ekey, password } => vec![
            ("ekey".to_string(), ekey.clone()),
            ("password".to_string(), password.clone()),
        ],
        Credentials::Facebook { access_token } => {
            vec![("fb_access_token".to_string(), access_token.clone())]
        }
    };
    params.push(("token_version".to_string(), TOKEN_VERSION.to_string()));
    params
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, call: ApiCall) -> Result<Value, ApiError> {
        let mut params = call.params;
        if let Some(token) = &call.session {
            params.push(("session_token".to_string(), token.session_token.clone()));
            if let Some(signature) = self.signer.sign_call(&call.path, &params, token) {
                params.push(("signature".to_string(), signature));
            }
        }
        self.get(&call.path, &params, call.timeout).await
    }

    async fn fetch_session_token(&self, credentials: &Credentials) -> SessionTokenResponse {
        let mut params = login_params(credentials);
        params.extend(self.signer.sign_login(credentials));
        debug!("fetching session token kind={}", credentials.kind());
        match self.get(SESSION_TOKEN_PATH, &params, None).await {
            Ok(response) => SessionTokenResponse::from_json(&response),
            Err(e) => SessionTokenResponse::from_error(e),
        }
    }

    async fn check_status(&self) -> Result<(), ApiError> {
        self.get(STATUS_PATH, &[], None).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_envelope_success() {
        let response = decode_envelope(json!({
            "response": { "result": "Success", "action": "user/get_info" }
        }))
        .unwrap();
        assert_eq!(response["action"], "user/get_info");
    }

    #[test]
    fn test_decode_envelope_error_code() {
        let err = decode_envelope(json!({
            "response": { "result": "Error", "error": 105, "message": "Session token invalid" }
        }))
        .unwrap_err();
        assert!(err.is_invalid_session_token());

        let err = decode_envelope(json!({
            "response": { "result": "Error", "error": "243", "message": "locked" }
        }))
        .unwrap_err();
        assert!(matches!(err, ApiError::AccountTemporarilyLocked { .. }));
    }

    #[test]
    fn test_decode_envelope_malformed() {
        assert!(matches!(
            decode_envelope(json!([1, 2])),
            Err(ApiError::InvalidContent(_))
        ));
        assert!(matches!(
            decode_envelope(json!({ "other": {} })),
            Err(ApiError::InvalidContent(_))
        ));
    }

    #[test]
    fn test_login_params() {
        let params = login_params(&Credentials::facebook("fb"));
        assert!(params.contains(&("fb_access_token".to_string(), "fb".to_string())));
        assert!(params.contains(&("token_version".to_string(), "2".to_string())));
    }

    #[test]
    fn test_new_rejects_bad_url() {
        assert!(HttpTransport::new("not a url").is_err());
        assert!(HttpTransport::new("http://127.0.0.1:1").is_ok());
    }
}
