/// Application name
pub const APP_NAME: &str = "rolesync";

/// Default number of attempts for one external call (first try included)
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Default initial backoff delay in milliseconds
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;

/// Default backoff ceiling in milliseconds
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;

/// Default timeout for a single external call in seconds
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;

/// Default number of (person, chat) operations allowed in flight at once
pub const DEFAULT_MAX_CONCURRENT_OPS: usize = 8;

/// Default sustained external call rate (calls per second)
pub const DEFAULT_API_RATE_PER_SEC: f64 = 20.0;

/// Default external call burst size
pub const DEFAULT_API_BURST: f64 = 30.0;

/// Default background sweep interval in seconds
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Audit records older than this are pruned by the sweeper
pub const DEFAULT_AUDIT_RETENTION_DAYS: i64 = 90;

/// Lifetime of an invitation link in seconds
pub const DEFAULT_INVITE_TTL_SECS: u64 = 3 * 24 * 60 * 60;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Telegram Bot API endpoint
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
