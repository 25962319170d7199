// Error taxonomy delivered to call callbacks and used to drive retry and state decisions.

use std::fmt;

use thiserror::Error;

/// Result codes the server reports in `response.error` that the engine acts on.
pub mod result_code {
    pub const SESSION_TOKEN_INVALID: i32 = 105;
    pub const CREDENTIALS_INVALID: i32 = 107;
    pub const SIGNATURE_INVALID: i32 = 127;
    pub const PARAMETERS_INVALID: i32 = 129;
    pub const ASYNC_OPERATION_IN_PROGRESS: i32 = 208;
    pub const FACEBOOK_AUTHENTICATION_FAILURE: i32 = 220;
    pub const ACCOUNT_TEMPORARILY_LOCKED: i32 = 243;
}

/// Failure classes reported by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    UnableToResolve,
    UnableToConnect,
    UnableToConnectToProxy,
    ProxyProtocolFailure,
    SslHandshakeFailure,
    WriteFailure,
    ReadFailure,
    IoTimeout,
    InvalidUrl,
    HttpStatus(u16),
    Other,
}

impl TransportErrorKind {
    /// Whether this failure means the remote server is unreachable.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::UnableToResolve
                | TransportErrorKind::UnableToConnect
                | TransportErrorKind::UnableToConnectToProxy
                | TransportErrorKind::ProxyProtocolFailure
                | TransportErrorKind::SslHandshakeFailure
                | TransportErrorKind::WriteFailure
                | TransportErrorKind::ReadFailure
                | TransportErrorKind::IoTimeout
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::UnableToResolve => write!(f, "unable to resolve host"),
            TransportErrorKind::UnableToConnect => write!(f, "unable to connect"),
            TransportErrorKind::UnableToConnectToProxy => write!(f, "unable to connect to proxy"),
            TransportErrorKind::ProxyProtocolFailure => write!(f, "proxy protocol failure"),
            TransportErrorKind::SslHandshakeFailure => write!(f, "ssl handshake failure"),
            TransportErrorKind::WriteFailure => write!(f, "write failure"),
            TransportErrorKind::ReadFailure => write!(f, "read failure"),
            TransportErrorKind::IoTimeout => write!(f, "i/o timeout"),
            TransportErrorKind::InvalidUrl => write!(f, "invalid url"),
            TransportErrorKind::HttpStatus(status) => write!(f, "http status {}", status),
            TransportErrorKind::Other => write!(f, "transport failure"),
        }
    }
}

/// Which wait expired before a request could be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// No session token became available before the deadline.
    SessionTokenUnavailable,
    /// The request could not be sent before the deadline.
    ConnectionUnavailable,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::SessionTokenUnavailable => {
                f.write_str("no session token was available before the timeout was reached")
            }
            TimeoutKind::ConnectionUnavailable => {
                f.write_str("connection unavailable before the timeout was reached")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("session token rejected (code {code}): {message}")]
    InvalidSessionToken { code: i32, message: String },

    #[error("operation already in progress: {message}")]
    OperationInProgress { message: String },

    #[error("credentials rejected (code {code}): {message}")]
    InvalidCredentials { code: i32, message: String },

    #[error("account temporarily locked: {message}")]
    AccountTemporarilyLocked { message: String },

    #[error("api error {code}: {message}")]
    Api { code: i32, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Timeout(TimeoutKind),

    #[error("invalid response content: {0}")]
    InvalidContent(String),
}

impl ApiError {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        ApiError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Map a server `response.error` code to its error class.
    pub fn from_result_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            result_code::SESSION_TOKEN_INVALID | result_code::SIGNATURE_INVALID => {
                ApiError::InvalidSessionToken { code, message }
            }
            result_code::CREDENTIALS_INVALID
            | result_code::PARAMETERS_INVALID
            | result_code::FACEBOOK_AUTHENTICATION_FAILURE => {
                ApiError::InvalidCredentials { code, message }
            }
            result_code::ASYNC_OPERATION_IN_PROGRESS => ApiError::OperationInProgress { message },
            result_code::ACCOUNT_TEMPORARILY_LOCKED => ApiError::AccountTemporarilyLocked { message },
            _ => ApiError::Api { code, message },
        }
    }

    pub fn is_invalid_session_token(&self) -> bool {
        matches!(self, ApiError::InvalidSessionToken { .. })
    }

    pub fn is_invalid_credentials(&self) -> bool {
        matches!(self, ApiError::InvalidCredentials { .. })
    }

    /// Errors that a token-bearing request may retry within its budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::InvalidSessionToken { .. } | ApiError::OperationInProgress { .. }
        )
    }

    /// Whether this error means the server could not be reached at all.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            ApiError::Transport { kind, .. } => kind.is_connection_failure(),
            _ => false,
        }
    }
}
