// Session token data and the response produced when minting one.

use serde_json::Value;

use super::descriptor::ApiResponse;
use crate::error::ApiError;

const SECRET_KEY_MULTIPLIER: i64 = 16_807;
const SECRET_KEY_MODULUS: i64 = 2_147_483_647;

/// A minted session token plus the material needed to sign calls with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokenData {
    pub session_token: String,
    pub pkey: String,
    pub time: String,
    pub secret_key: i32,
}

impl SessionTokenData {
    /// Advance the signing secret after the server asked for a new key.
    pub fn rotate_secret_key(&mut self) {
        self.secret_key = next_secret_key(self.secret_key);
    }
}

pub fn next_secret_key(current: i32) -> i32 {
    // Result is below the modulus so it always fits in an i32.
    ((current as i64 * SECRET_KEY_MULTIPLIER).rem_euclid(SECRET_KEY_MODULUS)) as i32
}

/// Outcome of a token fetch. On failure only `error` is meaningful.
#[derive(Debug, Clone, Default)]
pub struct SessionTokenResponse {
    pub session_token: String,
    pub pkey: String,
    pub time: String,
    pub secret_key: i32,
    pub ekey: Option<String>,
    pub error: Option<ApiError>,
}

impl SessionTokenResponse {
    pub fn token_data(&self) -> SessionTokenData {
        SessionTokenData {
            session_token: self.session_token.clone(),
            pkey: self.pkey.clone(),
            time: self.time.clone(),
            secret_key: self.secret_key,
        }
    }

    /// Read the token fields out of a decoded `response` object.
    pub fn from_json(response: &Value) -> Self {
        let text = |key: &str| {
            response
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let session_token = match text("session_token") {
            Some(token) if !token.is_empty() => token,
            _ => {
                return Self::from_error(ApiError::InvalidContent(
                    "missing session_token".to_string(),
                ))
            }
        };

        // The server sends the secret key as a decimal string.
        let secret_key = match response.get("secret_key") {
            Some(Value::String(s)) => s.parse::<i64>().ok(),
            Some(Value::Number(n)) => n.as_i64(),
            _ => None,
        };
        let secret_key = match secret_key.and_then(|k| i32::try_from(k).ok()) {
            Some(k) => k,
            None => {
                return Self::from_error(ApiError::InvalidContent(
                    "missing or malformed secret_key".to_string(),
                ))
            }
        };

        Self {
            session_token,
            pkey: text("pkey").unwrap_or_default(),
            time: text("time").unwrap_or_default(),
            secret_key,
            ekey: text("ekey"),
            error: None,
        }
    }
}

impl ApiResponse for SessionTokenResponse {
    fn from_error(error: ApiError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    fn error(&self) -> Option<&ApiError> {
        self.error.as_ref()
    }
}
