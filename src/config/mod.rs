//! Configuration for the signing broker.
//!
//! Settings are loaded with priority: env var > TOML config file > default.
//! `./.env` and `~/.igloo/.env` are loaded through dotenvy early in startup;
//! dotenvy never overwrites variables that are already set.

pub(crate) mod helpers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;
use crate::request::RequestType;
use crate::settings::Settings;

/// Per-caller sliding-window admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    #[serde(with = "duration_ms")]
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchConfig {
    #[serde(with = "duration_ms")]
    pub window: Duration,
    pub kind: RequestType,
}

/// Resolved broker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrokerConfig {
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub queue_capacity: usize,
    #[serde(with = "duration_ms")]
    pub health_timeout: Duration,
    pub batch: BatchConfig,
    #[serde(with = "duration_ms")]
    pub blocking_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            rate_limit: RateLimitConfig {
                max_requests: settings.rate_limit.max_requests,
                window: Duration::from_millis(settings.rate_limit.window_ms),
            },
            cache: CacheConfig {
                ttl: Duration::from_millis(settings.cache.ttl_ms),
                capacity: settings.cache.capacity,
            },
            queue_capacity: settings.queue.capacity,
            health_timeout: Duration::from_millis(settings.health.timeout_ms),
            batch: BatchConfig {
                window: Duration::from_millis(settings.batch.window_ms),
                kind: RequestType::SignEvent,
            },
            blocking_timeout: Duration::from_millis(settings.adapter.blocking_timeout_ms),
        }
    }
}

/// Path to the broker-specific `.env` file: `~/.igloo/.env`.
pub fn igloo_env_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".igloo")
        .join(".env")
}

fn load_dotenv() {
    let _ = dotenvy::dotenv();
    let path = igloo_env_path();
    if path.exists() {
        let _ = dotenvy::from_path(&path);
    }
}

impl BrokerConfig {
    /// Load configuration from env vars over the default TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional explicit TOML config file.
    ///
    /// An explicit path that fails to load is an error; a broken default
    /// file only logs a warning.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        load_dotenv();

        let settings = match toml_path {
            Some(path) => Settings::load_toml(path)
                .map_err(ConfigError::ParseError)?
                .ok_or_else(|| {
                    ConfigError::ParseError(format!("config file {} not found", path.display()))
                })?,
            None => match Settings::load_toml(&Settings::default_toml_path()) {
                Ok(Some(settings)) => settings,
                Ok(None) => Settings::default(),
                Err(e) => {
                    tracing::warn!("Failed to load default config file: {}", e);
                    Settings::default()
                }
            },
        };

        Self::resolve(&settings)
    }

    /// Apply env-var overrides on top of `settings` and validate the result.
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let max_requests = helpers::require_positive(
            "BROKER_RATE_LIMIT_MAX_REQUESTS",
            helpers::parse_env_or(
                "BROKER_RATE_LIMIT_MAX_REQUESTS",
                settings.rate_limit.max_requests,
                "a positive integer",
            )?,
        )?;
        let rate_window_ms = helpers::require_positive(
            "BROKER_RATE_LIMIT_WINDOW_MS",
            helpers::parse_env_or(
                "BROKER_RATE_LIMIT_WINDOW_MS",
                settings.rate_limit.window_ms,
                "a positive integer",
            )?,
        )?;

        let cache_ttl_ms = helpers::require_positive(
            "BROKER_CACHE_TTL_MS",
            helpers::parse_env_or(
                "BROKER_CACHE_TTL_MS",
                settings.cache.ttl_ms,
                "a positive integer",
            )?,
        )?;
        let cache_capacity = helpers::require_positive(
            "BROKER_CACHE_CAPACITY",
            helpers::parse_env_or(
                "BROKER_CACHE_CAPACITY",
                settings.cache.capacity,
                "a positive integer",
            )?,
        )?;

        let queue_capacity = helpers::require_positive(
            "BROKER_QUEUE_CAPACITY",
            helpers::parse_env_or(
                "BROKER_QUEUE_CAPACITY",
                settings.queue.capacity,
                "a positive integer",
            )?,
        )?;

        let health_timeout_ms = helpers::require_positive(
            "BROKER_HEALTH_TIMEOUT_MS",
            helpers::parse_env_or(
                "BROKER_HEALTH_TIMEOUT_MS",
                settings.health.timeout_ms,
                "a positive integer",
            )?,
        )?;

        let batch_window_ms = helpers::require_positive(
            "BROKER_BATCH_WINDOW_MS",
            helpers::parse_env_or(
                "BROKER_BATCH_WINDOW_MS",
                settings.batch.window_ms,
                "a positive integer",
            )?,
        )?;
        let batch_kind_raw = helpers::optional_env("BROKER_BATCH_KIND")?
            .unwrap_or_else(|| settings.batch.kind.clone());
        let batch_kind = batch_kind_raw
            .parse::<RequestType>()
            .map_err(|message| ConfigError::InvalidValue {
                key: "BROKER_BATCH_KIND".to_string(),
                message,
            })?;

        let blocking_timeout_ms = helpers::require_positive(
            "BROKER_BLOCKING_TIMEOUT_MS",
            helpers::parse_env_or(
                "BROKER_BLOCKING_TIMEOUT_MS",
                settings.adapter.blocking_timeout_ms,
                "a positive integer",
            )?,
        )?;

        Ok(Self {
            rate_limit: RateLimitConfig {
                max_requests,
                window: Duration::from_millis(rate_window_ms),
            },
            cache: CacheConfig {
                ttl: Duration::from_millis(cache_ttl_ms),
                capacity: cache_capacity,
            },
            queue_capacity,
            health_timeout: Duration::from_millis(health_timeout_ms),
            batch: BatchConfig {
                window: Duration::from_millis(batch_window_ms),
                kind: batch_kind,
            },
            blocking_timeout: Duration::from_millis(blocking_timeout_ms),
        })
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}
