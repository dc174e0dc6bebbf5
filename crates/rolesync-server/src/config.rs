//! Server configuration loaded from environment variables.
//!
//! Every setting has a default, so the server starts with nothing but
//! `BOT_TOKEN` set.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rolesync_engine::{EngineConfig, RetryPolicy};
use rolesync_shared::constants::{
    DEFAULT_API_BURST, DEFAULT_API_RATE_PER_SEC, DEFAULT_AUDIT_RETENTION_DAYS,
    DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_HTTP_PORT, DEFAULT_INVITE_TTL_SECS,
    DEFAULT_MAX_CONCURRENT_OPS,
    DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_MS,
    DEFAULT_SWEEP_INTERVAL_SECS, TELEGRAM_API_BASE,
};

#[derive(Clone)]
pub struct ServerConfig {
    /// Env: `HTTP_ADDR`. Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Env: `DATABASE_PATH`. Default: the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Telegram bot token. Env: `BOT_TOKEN`
    pub bot_token: Option<String>,

    /// Env: `CHAT_API_BASE_URL`. Default: `https://api.telegram.org`
    pub chat_api_base_url: String,

    /// Bearer token for `/api/*`. The API refuses every request when unset.
    /// Env: `ADMIN_TOKEN`
    pub admin_token: Option<String>,

    /// Env: `MAX_CONCURRENT_OPS`
    pub max_concurrent_ops: usize,
    /// Env: `API_RATE_PER_SEC`
    pub api_rate_per_sec: f64,
    /// Env: `API_BURST`
    pub api_burst: f64,

    /// Env: `RETRY_MAX_ATTEMPTS`
    pub retry_max_attempts: u32,
    /// Env: `RETRY_BASE_MS`
    pub retry_base_ms: u64,
    /// Env: `RETRY_MAX_MS`
    pub retry_max_ms: u64,

    /// Env: `CALL_TIMEOUT_SECS`
    pub call_timeout_secs: u64,
    /// Env: `SWEEP_INTERVAL_SECS`
    pub sweep_interval_secs: u64,
    /// Env: `AUDIT_RETENTION_DAYS`
    pub audit_retention_days: i64,

    /// How long an invitation link stays usable. Env: `INVITE_TTL_SECS`
    pub invite_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            bot_token: None,
            chat_api_base_url: TELEGRAM_API_BASE.to_string(),
            admin_token: None,
            max_concurrent_ops: DEFAULT_MAX_CONCURRENT_OPS,
            api_rate_per_sec: DEFAULT_API_RATE_PER_SEC,
            api_burst: DEFAULT_API_BURST,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            retry_max_ms: DEFAULT_RETRY_MAX_MS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            audit_retention_days: DEFAULT_AUDIT_RETENTION_DAYS,
            invite_ttl_secs: DEFAULT_INVITE_TTL_SECS,
        }
    }
}

// Tokens stay out of logs.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("chat_api_base_url", &self.chat_api_base_url)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("max_concurrent_ops", &self.max_concurrent_ops)
            .field("api_rate_per_sec", &self.api_rate_per_sec)
            .field("api_burst", &self.api_burst)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("retry_base_ms", &self.retry_base_ms)
            .field("retry_max_ms", &self.retry_max_ms)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("audit_retention_days", &self.audit_retention_days)
            .field("invite_ttl_secs", &self.invite_ttl_secs)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(token) = lookup("BOT_TOKEN").filter(|t| !t.is_empty()) {
            config.bot_token = Some(token);
        }

        if let Some(url) = lookup("CHAT_API_BASE_URL").filter(|u| !u.is_empty()) {
            config.chat_api_base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(token) = lookup("ADMIN_TOKEN").filter(|t| !t.is_empty()) {
            config.admin_token = Some(token);
        }

        parse_into(&lookup, "MAX_CONCURRENT_OPS", &mut config.max_concurrent_ops);
        parse_into(&lookup, "API_RATE_PER_SEC", &mut config.api_rate_per_sec);
        parse_into(&lookup, "API_BURST", &mut config.api_burst);
        parse_into(&lookup, "RETRY_MAX_ATTEMPTS", &mut config.retry_max_attempts);
        parse_into(&lookup, "RETRY_BASE_MS", &mut config.retry_base_ms);
        parse_into(&lookup, "RETRY_MAX_MS", &mut config.retry_max_ms);
        parse_into(&lookup, "CALL_TIMEOUT_SECS", &mut config.call_timeout_secs);
        parse_into(&lookup, "SWEEP_INTERVAL_SECS", &mut config.sweep_interval_secs);
        parse_into(&lookup, "AUDIT_RETENTION_DAYS", &mut config.audit_retention_days);
        parse_into(&lookup, "INVITE_TTL_SECS", &mut config.invite_ttl_secs);

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn invite_ttl(&self) -> Duration {
        Duration::from_secs(self.invite_ttl_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// The engine-relevant subset.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_concurrent_ops: self.max_concurrent_ops,
            api_rate_per_sec: self.api_rate_per_sec,
            api_burst: self.api_burst,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base: Duration::from_millis(self.retry_base_ms),
                max: Duration::from_millis(self.retry_max_ms),
            },
            call_timeout: self.call_timeout(),
            audit_retention_days: self.audit_retention_days,
        }
    }
}

/// Overwrite `target` with the parsed variable. An unparsable value is
/// logged and the default kept.
fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T)
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(e) => tracing::warn!(key, value = %raw, error = %e, "Invalid value, using default"),
    }
}
