use std::time::Duration;

use rolesync_shared::constants::{
    DEFAULT_API_BURST, DEFAULT_API_RATE_PER_SEC, DEFAULT_AUDIT_RETENTION_DAYS,
    DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT_OPS,
};

use crate::retry::RetryPolicy;

/// Tuning knobs for the synchronization engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on (person, chat) operations executing at once, across
    /// all persons.
    pub max_concurrent_ops: usize,

    /// Sustained external call rate. `0` disables the token bucket.
    pub api_rate_per_sec: f64,

    /// Token bucket capacity.
    pub api_burst: f64,

    /// Attempts and backoff for a single external call.
    pub retry: RetryPolicy,

    /// Bound on one external call. Elapsed calls count as transient.
    pub call_timeout: Duration,

    /// Audit records older than this many days are pruned by the sweeper.
    pub audit_retention_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: DEFAULT_MAX_CONCURRENT_OPS,
            api_rate_per_sec: DEFAULT_API_RATE_PER_SEC,
            api_burst: DEFAULT_API_BURST,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            audit_retention_days: DEFAULT_AUDIT_RETENTION_DAYS,
        }
    }
}
