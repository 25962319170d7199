// Observable session state machine values.

use std::fmt;

use super::token::SessionTokenResponse;
use crate::error::ApiError;

#[derive(Debug, Clone)]
pub enum SessionState {
    /// No credentials. Entering this state forgets credentials and tokens.
    Uninitialized,
    /// Credentials set, no token minted with them yet.
    Initialized,
    /// The server rejected the credentials.
    CredentialsFailure {
        pkey: Option<String>,
        error: ApiError,
        last_response: SessionTokenResponse,
    },
    /// Token fetching keeps failing for reasons other than bad credentials.
    ProlongedError {
        error: ApiError,
        last_response: SessionTokenResponse,
    },
    Running {
        last_response: SessionTokenResponse,
    },
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running { .. })
    }

    /// States from which only new credentials or a backoff expiry recover.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SessionState::CredentialsFailure { .. } | SessionState::ProlongedError { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initialized => "initialized",
            SessionState::CredentialsFailure { .. } => "credentials_failure",
            SessionState::ProlongedError { .. } => "prolonged_error",
            SessionState::Running { .. } => "running",
        }
    }
}

impl PartialEq for SessionState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SessionState::Uninitialized, SessionState::Uninitialized) => true,
            (SessionState::Initialized, SessionState::Initialized) => true,
            (
                SessionState::CredentialsFailure {
                    pkey: a_pkey,
                    error: a_error,
                    ..
                },
                SessionState::CredentialsFailure {
                    pkey: b_pkey,
                    error: b_error,
                    ..
                },
            ) => a_pkey == b_pkey && a_error == b_error,
            (
                SessionState::ProlongedError { error: a, .. },
                SessionState::ProlongedError { error: b, .. },
            ) => a == b,
            (
                SessionState::Running { last_response: a },
                SessionState::Running { last_response: b },
            ) => a.session_token == b.session_token && a.pkey == b.pkey,
            _ => false,
        }
    }
}

impl Eq for SessionState {}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::CredentialsFailure { error, .. }
            | SessionState::ProlongedError { error, .. } => {
                write!(f, "{} ({})", self.name(), error)
            }
            _ => f.write_str(self.name()),
        }
    }
}
