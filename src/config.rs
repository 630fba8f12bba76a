//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::ratelimit::{FailureMode, Quota, DEFAULT_LIMIT, DEFAULT_WINDOW_SECS};

/// Prefix for environment variable overrides, e.g. `RATEWARDEN__SERVER__HTTP_ADDR`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Tiered rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// In-memory limiter for unauthenticated traffic
    #[serde(default)]
    pub anonymous: AnonymousLimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Build `AuthUser` from `X-User-Id` / `X-User-Role` headers on `/api` routes.
    /// Only enable behind an upstream that sets or strips them.
    #[serde(default)]
    pub trust_identity_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_identity_headers: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Tiered rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML policy file (used when no database is configured)
    #[serde(default)]
    pub policy_path: Option<String>,

    /// SQLite URL for policies and the request log, e.g. `sqlite://ratewarden.db`
    #[serde(default)]
    pub database_url: Option<String>,

    /// Limit applied when no endpoint, user or role policy matches
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Window of the default tier, in seconds
    #[serde(default = "default_window_secs")]
    pub default_window_secs: u64,

    /// What to do when the policy store or request counter fails
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Timeout for each policy lookup and count query, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// How long request log entries are kept before pruning, in seconds
    #[serde(default = "default_log_retention_secs")]
    pub log_retention_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            policy_path: None,
            database_url: None,
            default_limit: default_limit(),
            default_window_secs: default_window_secs(),
            failure_mode: FailureMode::default(),
            store_timeout_ms: default_store_timeout_ms(),
            log_retention_secs: default_log_retention_secs(),
        }
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_log_retention_secs() -> u64 {
    86_400
}

impl RateLimitingConfig {
    /// The quota of the default tier.
    pub fn default_quota(&self) -> Quota {
        Quota::new(self.default_limit, self.default_window_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn log_retention(&self) -> Duration {
        Duration::from_secs(self.log_retention_secs)
    }
}

/// Configuration for the in-memory fixed-window limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymousLimiterConfig {
    /// Requests allowed per key and window
    #[serde(default = "default_anonymous_limit")]
    pub limit: u64,

    /// Window length in minutes
    #[serde(default = "default_anonymous_window_minutes")]
    pub window_minutes: u64,

    /// Entry count above which expired entries are swept
    #[serde(default = "default_anonymous_max_entries")]
    pub max_entries: usize,
}

impl Default for AnonymousLimiterConfig {
    fn default() -> Self {
        Self {
            limit: default_anonymous_limit(),
            window_minutes: default_anonymous_window_minutes(),
            max_entries: default_anonymous_max_entries(),
        }
    }
}

fn default_anonymous_limit() -> u64 {
    100
}

fn default_anonymous_window_minutes() -> u64 {
    1
}

fn default_anonymous_max_entries() -> usize {
    crate::ratelimit::DEFAULT_MAX_ENTRIES
}

impl WardenConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WardenConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under `RATEWARDEN__*`
    /// environment variables.
    ///
    /// The file format is picked from its extension (YAML, TOML or JSON).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(WardenError::Config(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<WardenConfig>())
            .map_err(|e| WardenError::Config(e.to_string()))
    }
}
