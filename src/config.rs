//! Service configuration.
//!
//! All secrets and tunables are read from the environment exactly once at
//! startup and carried in an explicit struct. Business logic never touches
//! `std::env` — components receive the config (or the piece they need) at
//! construction, which is what makes them testable with fake keys.

use crate::error::TriageError;

/// Default delay before a pending message becomes a batch candidate.
/// Rapid-fire messages from the same sender land inside one window and get
/// collapsed instead of producing one LLM call each.
pub const DEFAULT_BATCH_WINDOW_MINUTES: i64 = 4;

/// Default cap on messages per batch run, bounding per-run cost and latency.
pub const DEFAULT_BATCH_LIMIT: usize = 50;

/// Days between subscription expiry and hard lockout.
pub const DEFAULT_GRACE_PERIOD_DAYS: i64 = 7;

/// Days a blocked account survives before it is marked for deletion.
pub const DEFAULT_DELETION_AFTER_DAYS: i64 = 30;

/// Days a read message is kept before the retention sweep removes it.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Minutes after which a `processing` claim is considered stale and the
/// message is reclaimed by the next batch run.
pub const DEFAULT_PROCESSING_LEASE_MINUTES: i64 = 10;

/// Timeout applied to LLM and provider API calls.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_path: std::path::PathBuf,
    pub openai_api_key: String,
    pub instagram_app_id: String,
    pub instagram_app_secret: String,
    /// Shared secret echoed back during the webhook verification handshake.
    pub webhook_verify_token: String,
    /// 256-bit AES key for token encryption at rest.
    pub encryption_key: [u8; 32],
    pub batch_window_minutes: i64,
    pub batch_limit: usize,
    pub grace_period_days: i64,
    pub deletion_after_days: i64,
    pub retention_days: i64,
    pub processing_lease_minutes: i64,
    pub http_timeout_secs: u64,
}

impl Config {
    /// Load configuration from the environment. Called once in `main`.
    pub fn from_env() -> Result<Self, TriageError> {
        let encryption_key_hex = require("ENCRYPTION_KEY")?;
        let key_bytes = hex::decode(&encryption_key_hex)
            .map_err(|e| TriageError::Config(format!("ENCRYPTION_KEY is not valid hex: {e}")))?;
        let encryption_key: [u8; 32] = key_bytes.try_into().map_err(|v: Vec<u8>| {
            TriageError::Config(format!(
                "ENCRYPTION_KEY must be 32 bytes (256-bit), got {}",
                v.len()
            ))
        })?;

        Ok(Self {
            bind_addr: env_or("DMTRIAGE_BIND_ADDR", "0.0.0.0:8080"),
            database_path: env_or("DATABASE_PATH", "dmtriage.db").into(),
            openai_api_key: require("OPENAI_API_KEY")?,
            instagram_app_id: require("INSTAGRAM_APP_ID")?,
            instagram_app_secret: require("INSTAGRAM_APP_SECRET")?,
            webhook_verify_token: require("IG_VERIFY_TOKEN")?,
            encryption_key,
            batch_window_minutes: env_i64("BATCH_WINDOW_MINUTES", DEFAULT_BATCH_WINDOW_MINUTES)?,
            batch_limit: env_i64("BATCH_LIMIT", DEFAULT_BATCH_LIMIT as i64)? as usize,
            grace_period_days: env_i64("GRACE_PERIOD_DAYS", DEFAULT_GRACE_PERIOD_DAYS)?,
            deletion_after_days: env_i64("DELETION_AFTER_DAYS", DEFAULT_DELETION_AFTER_DAYS)?,
            retention_days: env_i64("RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?,
            processing_lease_minutes: env_i64(
                "PROCESSING_LEASE_MINUTES",
                DEFAULT_PROCESSING_LEASE_MINUTES,
            )?,
            http_timeout_secs: env_i64("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS as i64)?
                as u64,
        })
    }

    /// Fixed configuration for tests — fake secrets, default tunables.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            database_path: ":memory:".into(),
            openai_api_key: "test-key".to_string(),
            instagram_app_id: "test-app-id".to_string(),
            instagram_app_secret: "test-app-secret".to_string(),
            webhook_verify_token: "verify-me".to_string(),
            encryption_key: [7u8; 32],
            batch_window_minutes: DEFAULT_BATCH_WINDOW_MINUTES,
            batch_limit: DEFAULT_BATCH_LIMIT,
            grace_period_days: DEFAULT_GRACE_PERIOD_DAYS,
            deletion_after_days: DEFAULT_DELETION_AFTER_DAYS,
            retention_days: DEFAULT_RETENTION_DAYS,
            processing_lease_minutes: DEFAULT_PROCESSING_LEASE_MINUTES,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

fn require(name: &str) -> Result<String, TriageError> {
    std::env::var(name).map_err(|_| TriageError::Config(format!("{name} is not set")))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_i64(name: &str, default: i64) -> Result<i64, TriageError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| TriageError::Config(format!("{name} is not a number: {raw}"))),
        Err(_) => Ok(default),
    }
}
