//! Broker settings persistence.
//!
//! Stores operator preferences in `~/.igloo/broker.toml`.
//! Settings are loaded with env var > broker.toml > default priority; the env
//! layer is applied by [`crate::config::BrokerConfig::resolve`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Broker settings persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub batch: BatchSettings,

    #[serde(default)]
    pub adapter: AdapterSettings,
}

/// Per-caller admission window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Maximum admissions per caller within one window.
    #[serde(default = "default_rate_limit_max_requests")]
    pub max_requests: u32,

    /// Window length in milliseconds.
    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,
}

fn default_rate_limit_max_requests() -> u32 {
    20
}

fn default_rate_limit_window_ms() -> u64 {
    10_000
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_rate_limit_max_requests(),
            window_ms: default_rate_limit_window_ms(),
        }
    }
}

/// Result cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheSettings {
    /// Age in milliseconds past which a cached result is treated as absent.
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,

    /// Maximum number of cached results.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

fn default_cache_ttl_ms() -> u64 {
    5_000
}

fn default_cache_capacity() -> usize {
    256
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSettings {
    /// Maximum requests held while the signer is unavailable.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthSettings {
    /// Silence in milliseconds after which the signer is considered gone.
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSettings {
    /// Coalescing window in milliseconds.
    #[serde(default = "default_batch_window_ms")]
    pub window_ms: u64,

    /// The one request type routed through the batcher.
    #[serde(default = "default_batch_kind")]
    pub kind: String,
}

fn default_batch_window_ms() -> u64 {
    100
}

fn default_batch_kind() -> String {
    "sign_event".to_string()
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            window_ms: default_batch_window_ms(),
            kind: default_batch_kind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Upper bound for one blocking query, in milliseconds.
    #[serde(default = "default_blocking_timeout_ms")]
    pub blocking_timeout_ms: u64,
}

fn default_blocking_timeout_ms() -> u64 {
    30_000
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            blocking_timeout_ms: default_blocking_timeout_ms(),
        }
    }
}

impl Settings {
    /// Default TOML config file path (~/.igloo/broker.toml).
    pub fn default_toml_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".igloo")
            .join("broker.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `None` if the file doesn't exist. Returns an error only
    /// if the file exists but can't be parsed.
    pub fn load_toml(path: &Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        let settings: Self = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }

    /// Write a commented TOML config file with current settings.
    pub fn save_toml(&self, path: &Path) -> Result<(), String> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize settings: {}", e))?;

        let content = format!(
            "# igloo-broker configuration file.\n\
             #\n\
             # Priority: env var > this file > defaults.\n\
             # Run `igloo-broker config` to print the resolved values.\n\
             \n\
             {raw}"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }

        std::fs::write(path, content)
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.toml");

        let mut settings = Settings::default();
        settings.queue.capacity = 8;
        settings.batch.kind = "nip44_encrypt".to_string();

        settings.save_toml(&path).unwrap();
        let loaded = Settings::load_toml(&path).unwrap().unwrap();

        assert_eq!(loaded, settings);
    }

    #[test]
    fn toml_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = Settings::load_toml(&dir.path().join("absent.toml"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn toml_invalid_content_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml [[[").unwrap();

        assert!(Settings::load_toml(&path).is_err());
    }

    #[test]
    fn toml_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[cache]\nttl_ms = 750\n").unwrap();

        let loaded = Settings::load_toml(&path).unwrap().unwrap();
        assert_eq!(loaded.cache.ttl_ms, 750);
        assert_eq!(loaded.cache.capacity, 256);
        assert_eq!(loaded.rate_limit.max_requests, 20);
        assert_eq!(loaded.batch.kind, "sign_event");
    }

    #[test]
    fn toml_header_comment_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.toml");

        Settings::default().save_toml(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();

        assert!(content.starts_with("# igloo-broker configuration file."));
        assert!(content.contains("[rate_limit]"));
        assert!(content.contains("[batch]"));
    }
}
