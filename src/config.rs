// Engine tuning: token pool limits, retry timings and request timeouts.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Maximum number of session token fetches allowed in flight at once.
pub const MAX_IN_FLIGHT_TOKEN_REQUESTS: usize = 4;

/// Ceiling on pooled + checked-out + in-flight session tokens.
pub const MAX_TOKENS: usize = 10;

/// Default per-request timeout and retry budget in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u32 = 60;

/// Wait before fetching another token after a generic fetch failure.
pub const TOKEN_FAILURE_WAIT_MS: u64 = 2_500;

/// Wait between token fetches while the credentials are rejected. Throttled so
/// the account does not get locked.
pub const CREDENTIAL_FAILURE_WAIT_MS: u64 = 60_000;

/// Wait between token fetches while the account is temporarily locked. Retrying
/// sooner would keep resetting the server side lockout.
pub const ACCOUNT_LOCKED_WAIT_MS: u64 = 600_000;

/// Interval between connectivity probes while unconnected.
pub const CONNECTION_RECHECK_MS: u64 = 5_000;

/// Token fetches get a shorter timeout than regular calls.
pub const TOKEN_FETCH_TIMEOUT_SECONDS: u64 = 15;

/// Consecutive token fetch failures before the session is reported as
/// a prolonged error.
pub const PROLONGED_FAILURE_THRESHOLD: u32 = 10;

/// Delay before retrying a call the server reported as already in progress.
pub const IN_PROGRESS_RETRY_SECONDS: u64 = 1;

/// Default cap on concurrently running work units in a `WorkManager`.
pub const DEFAULT_MAX_CONCURRENT_WORK: usize = 10;

/// Top-level configuration for the session maintainer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintainerConfig {
    /// Per-request timeout, also the retry budget for token errors.
    pub timeout_seconds: u32,
    /// Maximum concurrent session token fetches.
    pub max_in_flight_token_requests: usize,
    /// Maximum tokens alive at once (pooled, checked out or being fetched).
    pub max_tokens: usize,
    pub token_failure_wait_ms: u64,
    pub credential_failure_wait_ms: u64,
    pub account_locked_wait_ms: u64,
    pub connection_recheck_ms: u64,
    pub token_fetch_timeout_seconds: u64,
    pub prolonged_failure_threshold: u32,
    pub in_progress_retry_seconds: u64,
}

impl Default for MaintainerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_in_flight_token_requests: MAX_IN_FLIGHT_TOKEN_REQUESTS,
            max_tokens: MAX_TOKENS,
            token_failure_wait_ms: TOKEN_FAILURE_WAIT_MS,
            credential_failure_wait_ms: CREDENTIAL_FAILURE_WAIT_MS,
            account_locked_wait_ms: ACCOUNT_LOCKED_WAIT_MS,
            connection_recheck_ms: CONNECTION_RECHECK_MS,
            token_fetch_timeout_seconds: TOKEN_FETCH_TIMEOUT_SECONDS,
            prolonged_failure_threshold: PROLONGED_FAILURE_THRESHOLD,
            in_progress_retry_seconds: IN_PROGRESS_RETRY_SECONDS,
        }
    }
}

impl MaintainerConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid maintainer config")
    }

    pub fn token_failure_wait(&self) -> Duration {
        Duration::from_millis(self.token_failure_wait_ms)
    }

    pub fn credential_failure_wait(&self) -> Duration {
        Duration::from_millis(self.credential_failure_wait_ms)
    }

    pub fn account_locked_wait(&self) -> Duration {
        Duration::from_millis(self.account_locked_wait_ms)
    }

    pub fn connection_recheck(&self) -> Duration {
        Duration::from_millis(self.connection_recheck_ms)
    }

    pub fn token_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.token_fetch_timeout_seconds)
    }

    pub fn in_progress_retry(&self) -> Duration {
        Duration::from_secs(self.in_progress_retry_seconds)
    }
}
