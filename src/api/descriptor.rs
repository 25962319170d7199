// Per-endpoint request descriptors and the response contract they produce.

use serde_json::Value;

use super::token::SessionTokenData;
use crate::error::ApiError;
use crate::transport::ApiCall;

/// What every response type must offer the maintainer.
pub trait ApiResponse: Sized {
    /// Build a response that only carries `error`. Used for timeouts,
    /// cancellation and transport failures.
    fn from_error(error: ApiError) -> Self;

    fn error(&self) -> Option<&ApiError>;

    /// The server asked the client to advance the token's secret key.
    fn new_key(&self) -> bool {
        false
    }
}

/// Describes one API call: how to build it and how to decode its answer.
///
/// `NEEDS_TOKEN` decides whether the maintainer waits for a session token
/// and stamps it via `stamp_token` before dispatch.
pub trait Descriptor: Send + 'static {
    type Response: ApiResponse + Send + 'static;

    const NEEDS_TOKEN: bool;

    fn stamp_token(&mut self, _token: &SessionTokenData) {}

    fn to_call(&self) -> ApiCall;

    /// Decode the `response` object of a successful round trip.
    fn parse_response(&self, response: Value) -> Self::Response;
}

/// Untyped response: the raw `response` object.
#[derive(Debug, Clone, Default)]
pub struct JsonResponse {
    pub value: Value,
    pub error: Option<ApiError>,
    pub new_key: bool,
}

impl JsonResponse {
    pub fn from_value(value: Value) -> Self {
        let new_key = value
            .get("new_key")
            .and_then(Value::as_str)
            .map(|s| s == "yes")
            .unwrap_or(false);
        Self {
            value,
            error: None,
            new_key,
        }
    }
}

impl ApiResponse for JsonResponse {
    fn from_error(error: ApiError) -> Self {
        Self {
            value: Value::Null,
            error: Some(error),
            new_key: false,
        }
    }

    fn error(&self) -> Option<&ApiError> {
        self.error.as_ref()
    }

    fn new_key(&self) -> bool {
        self.new_key
    }
}

/// A call that is sent without a session token.
#[derive(Debug, Clone)]
pub struct TokenlessCall {
    path: String,
    params: Vec<(String, String)>,
}

impl TokenlessCall {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

impl Descriptor for TokenlessCall {
    type Response = JsonResponse;

    const NEEDS_TOKEN: bool = false;

    fn to_call(&self) -> ApiCall {
        ApiCall {
            path: self.path.clone(),
            params: self.params.clone(),
            session: None,
            timeout: None,
        }
    }

    fn parse_response(&self, response: Value) -> JsonResponse {
        JsonResponse::from_value(response)
    }
}

/// A call that must carry a session token.
#[derive(Debug, Clone)]
pub struct SessionCall {
    path: String,
    params: Vec<(String, String)>,
    token: Option<SessionTokenData>,
}

impl SessionCall {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: Vec::new(),
            token: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn token(&self) -> Option<&SessionTokenData> {
        self.token.as_ref()
    }
}

impl Descriptor for SessionCall {
    type Response = JsonResponse;

    const NEEDS_TOKEN: bool = true;

    fn stamp_token(&mut self, token: &SessionTokenData) {
        self.token = Some(token.clone());
    }

    fn to_call(&self) -> ApiCall {
        ApiCall {
            path: self.path.clone(),
            params: self.params.clone(),
            session: self.token.clone(),
            timeout: None,
        }
    }

    fn parse_response(&self, response: Value) -> JsonResponse {
        JsonResponse::from_value(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_response_new_key() {
        let response = JsonResponse::from_value(json!({ "result": "Success", "new_key": "yes" }));
        assert!(response.new_key());
        let response = JsonResponse::from_value(json!({ "result": "Success", "new_key": "no" }));
        assert!(!response.new_key());
        assert!(response.error().is_none());
    }

    #[test]
    fn test_session_call_carries_stamped_token() {
        let mut call = SessionCall::new("/api/user/get_info.php").param("response_format", "json");
        assert!(call.to_call().session.is_none());
        call.stamp_token(&SessionTokenData {
            session_token: "tok".into(),
            pkey: "pk".into(),
            time: "0".into(),
            secret_key: 3,
        });
        let api_call = call.to_call();
        assert_eq!(api_call.session.map(|t| t.session_token), Some("tok".to_string()));
        assert_eq!(api_call.params.len(), 1);
    }

    #[test]
    fn test_tokenless_call_flag() {
        assert!(!TokenlessCall::NEEDS_TOKEN);
        assert!(SessionCall::NEEDS_TOKEN);
    }
}
