//! Runtime settings
//!
//! Loaded from (in order of priority):
//! 1. An explicit JSON file passed to [`Settings::from_file`]
//! 2. `mailpool.json` in the mailpool config directory
//! 3. Built-in defaults
//!
//! Every field is optional in the file; missing fields take their default.

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings filename in the mailpool config directory
const SETTINGS_FILE: &str = "mailpool.json";

/// Default database filename in the mailpool config directory
const DATABASE_FILE: &str = "mailpool.db";

/// Longest token cache duration or refresh buffer accepted (one year)
pub const MAX_TOKEN_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite database for tokens, cached mail and batch progress
    pub database_path: Option<PathBuf>,
    pub identity: IdentitySettings,
    pub tokens: TokenSettings,
    pub pool: PoolSettings,
    pub cache: CacheSettings,
    pub batch: BatchSettings,
}

/// Identity provider endpoint and scopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub token_url: String,
    /// Scope requested for accounts using the mailbox protocol
    pub imap_scope: String,
    /// Scope requested for accounts using the Graph API
    pub graph_scope: String,
    pub request_timeout_secs: u64,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            token_url: "https://login.microsoftonline.com/consumers/oauth2/v2.0/token".to_string(),
            imap_scope: "https://outlook.office.com/IMAP.AccessAsUser.All offline_access"
                .to_string(),
            graph_scope: "https://graph.microsoft.com/.default".to_string(),
            request_timeout_secs: 20,
        }
    }
}

impl IdentitySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Access token lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    /// Tokens this close to expiry are treated as expired
    pub refresh_buffer_secs: u64,
    /// Upper bound on how long a token is cached, whatever the provider says
    pub max_cache_secs: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            refresh_buffer_secs: 300,
            max_cache_secs: 3000,
        }
    }
}

impl TokenSettings {
    pub fn refresh_buffer(&self) -> chrono::Duration {
        bounded_seconds(self.refresh_buffer_secs)
    }

    pub fn max_cache_duration(&self) -> chrono::Duration {
        bounded_seconds(self.max_cache_secs)
    }
}

/// Seconds as a chrono duration, clamped to [`MAX_TOKEN_SECS`]
fn bounded_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_TOKEN_SECS) as i64)
}

/// Connection pool limits and timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum simultaneous sessions per account
    pub capacity_per_account: usize,
    /// How long `checkout` waits for a free session
    pub checkout_timeout_ms: u64,
    /// Deadline for opening and authenticating a session
    pub connect_timeout_secs: u64,
    /// Read/write deadline handed to sessions
    pub socket_timeout_secs: u64,
    /// Extra attempts after a transient connect failure
    pub connect_retries: u32,
    /// First backoff delay; doubles per attempt
    pub retry_base_delay_ms: u64,
    /// How long `drain` waits for graceful logouts
    pub drain_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity_per_account: 3,
            checkout_timeout_ms: 10_000,
            connect_timeout_secs: 15,
            socket_timeout_secs: 60,
            connect_retries: 2,
            retry_base_delay_ms: 250,
            drain_timeout_ms: 2_000,
        }
    }
}

impl PoolSettings {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Two-tier mail cache sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entries kept in each memory tier
    pub memory_capacity: usize,
    pub memory_ttl_secs: u64,
    /// Row budget of each persistent tier
    pub persistent_max_rows: usize,
    /// Byte budget of each persistent tier (stored, i.e. compressed, size)
    pub persistent_max_bytes: u64,
    /// Usage ratio above which eviction runs
    pub cleanup_threshold: f64,
    /// Share of rows evicted per cleanup
    pub eviction_fraction: f64,
    /// Payloads strictly larger than this are compressed
    pub compression_threshold_bytes: usize,
    /// zstd level
    pub compression_level: i32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_capacity: 512,
            memory_ttl_secs: 300,
            persistent_max_rows: 20_000,
            persistent_max_bytes: 256 * 1024 * 1024,
            cleanup_threshold: 0.9,
            eviction_fraction: 0.2,
            compression_threshold_bytes: 1024,
            compression_level: 3,
        }
    }
}

impl CacheSettings {
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }
}

/// Bulk operation concurrency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub default_concurrency: usize,
    /// Hard ceiling regardless of what a caller asks for
    pub max_concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            max_concurrency: 16,
        }
    }
}

impl Settings {
    /// Load settings from the config directory, falling back to defaults
    pub fn load() -> Result<Self> {
        if config::config_exists(SETTINGS_FILE) {
            let settings: Settings = config::load_json(SETTINGS_FILE)?;
            settings.validate()?;
            return Ok(settings);
        }
        Ok(Self::default())
    }

    /// Load settings from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings: Settings = config::load_json_file(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Settings =
            serde_json::from_str(json).context("Failed to parse settings JSON")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Database path, defaulting to the config directory
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| config::config_path(DATABASE_FILE))
    }

    /// Reject settings the components cannot honor
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.identity.token_url)
            .with_context(|| format!("Invalid token_url: {}", self.identity.token_url))?;
        ensure!(
            self.tokens.max_cache_secs <= MAX_TOKEN_SECS,
            "tokens.max_cache_secs ({}) must not exceed {}",
            self.tokens.max_cache_secs,
            MAX_TOKEN_SECS
        );
        ensure!(
            self.tokens.max_cache_secs > self.tokens.refresh_buffer_secs,
            "tokens.max_cache_secs ({}) must exceed tokens.refresh_buffer_secs ({})",
            self.tokens.max_cache_secs,
            self.tokens.refresh_buffer_secs
        );
        ensure!(
            self.pool.capacity_per_account > 0,
            "pool.capacity_per_account must be at least 1"
        );
        ensure!(
            self.cache.memory_capacity > 0,
            "cache.memory_capacity must be at least 1"
        );
        ensure!(
            self.cache.persistent_max_rows > 0 && self.cache.persistent_max_bytes > 0,
            "cache persistent limits must be positive"
        );
        ensure!(
            self.cache.cleanup_threshold > 0.0 && self.cache.cleanup_threshold <= 1.0,
            "cache.cleanup_threshold must be in (0, 1]"
        );
        ensure!(
            self.cache.eviction_fraction > 0.0 && self.cache.eviction_fraction <= 1.0,
            "cache.eviction_fraction must be in (0, 1]"
        );
        ensure!(
            self.batch.default_concurrency > 0 && self.batch.max_concurrency > 0,
            "batch concurrency must be at least 1"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "pool": { "capacity_per_account": 5 },
            "tokens": { "refresh_buffer_secs": 60 }
        }"#;

        let settings = Settings::from_json(json).unwrap();
        assert_eq!(settings.pool.capacity_per_account, 5);
        assert_eq!(settings.pool.connect_retries, 2);
        assert_eq!(settings.tokens.refresh_buffer_secs, 60);
        assert_eq!(settings.tokens.max_cache_secs, 3000);
        assert_eq!(settings.cache.compression_threshold_bytes, 1024);
    }

    #[test]
    fn test_rejects_buffer_larger_than_cache_duration() {
        let json = r#"{ "tokens": { "refresh_buffer_secs": 600, "max_cache_secs": 300 } }"#;
        assert!(Settings::from_json(json).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_token_durations() {
        let json = r#"{ "tokens": { "max_cache_secs": 10000000000000000 } }"#;
        assert!(Settings::from_json(json).is_err());

        let json = r#"{ "tokens": { "refresh_buffer_secs": 18446744073709551615 } }"#;
        assert!(Settings::from_json(json).is_err());

        let at_limit = format!(r#"{{ "tokens": {{ "max_cache_secs": {} }} }}"#, MAX_TOKEN_SECS);
        assert!(Settings::from_json(&at_limit).is_ok());
    }

    #[test]
    fn test_token_durations_never_overflow() {
        let tokens = TokenSettings {
            refresh_buffer_secs: u64::MAX,
            max_cache_secs: u64::MAX,
        };
        assert_eq!(
            tokens.max_cache_duration(),
            chrono::Duration::seconds(MAX_TOKEN_SECS as i64)
        );
        assert_eq!(tokens.refresh_buffer(), tokens.max_cache_duration());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let json = r#"{ "pool": { "capacity_per_account": 0 } }"#;
        assert!(Settings::from_json(json).is_err());
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let json = r#"{ "cache": { "cleanup_threshold": 1.5 } }"#;
        assert!(Settings::from_json(json).is_err());
    }

    #[test]
    fn test_explicit_database_path() {
        let json = r#"{ "database_path": "/var/lib/mailpool/cache.db" }"#;
        let settings = Settings::from_json(json).unwrap();
        assert_eq!(
            settings.database_path(),
            Some(PathBuf::from("/var/lib/mailpool/cache.db"))
        );
    }
}
