use std::fmt;

use crate::error::ApiError;

/// Whether the remote API is currently reachable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Unconnected {
        error: ApiError,
    },
    Connected,
}

impl ConnectionState {
    pub fn is_unconnected(&self) -> bool {
        matches!(self, ConnectionState::Unconnected { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Uninitialized => f.write_str("uninitialized"),
            ConnectionState::Unconnected { error } => write!(f, "unconnected ({})", error),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}
