//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (STAMPEDE_*)
//! 2. TOML config file (if STAMPEDE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::cache::StoreConfig;
use crate::message::MAX_BODY_BYTES;

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (STAMPEDE_*)
/// 2. TOML config file (if STAMPEDE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root directory of the persistent store.
    ///
    /// Set via STAMPEDE_ROOT_DIR environment variable.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Upstream fetch timeout in milliseconds.
    ///
    /// Set via STAMPEDE_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Address the proxy listens on.
    ///
    /// Set via STAMPEDE_LISTEN_ADDR environment variable.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Upstream `host:port` substituted into the Host header of every request.
    ///
    /// Set via STAMPEDE_UPSTREAM environment variable. When unset the
    /// request's own Host header is used.
    #[serde(default)]
    pub upstream: Option<String>,

    /// Largest response body that is relayed or cached.
    ///
    /// Set via STAMPEDE_MAX_BODY_BYTES environment variable.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Number of entries kept in the in-memory hot layer.
    #[serde(default = "default_capacity")]
    pub hot_cache_capacity: usize,

    /// Lifetime of a hot layer entry in seconds.
    #[serde(default = "default_hot_cache_ttl_secs")]
    pub hot_cache_ttl_secs: u64,

    /// Number of memoized request fingerprints.
    #[serde(default = "default_capacity")]
    pub fingerprint_capacity: usize,

    /// UDP address this process receives sibling purge messages on.
    ///
    /// Set via STAMPEDE_BRIDGE_BIND environment variable. Unset disables the bridge.
    #[serde(default)]
    pub bridge_bind: Option<SocketAddr>,

    /// UDP addresses of sibling processes sharing `root_dir`.
    ///
    /// Set via STAMPEDE_BRIDGE_PEERS environment variable (`[addr, addr]`).
    #[serde(default)]
    pub bridge_peers: Vec<SocketAddr>,

    /// Metrics frame length in seconds.
    #[serde(default = "default_metrics_flush_secs")]
    pub metrics_flush_secs: u64,

    /// Number of metrics frames kept in memory.
    #[serde(default = "default_metrics_frames")]
    pub metrics_frames: usize,
}

fn default_root_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".stampede")
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3002))
}

fn default_max_body_bytes() -> usize {
    MAX_BODY_BYTES
}

fn default_capacity() -> usize {
    1000
}

fn default_hot_cache_ttl_secs() -> u64 {
    60
}

fn default_metrics_flush_secs() -> u64 {
    5
}

fn default_metrics_frames() -> usize {
    180
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            timeout_ms: default_timeout_ms(),
            listen_addr: default_listen_addr(),
            upstream: None,
            max_body_bytes: default_max_body_bytes(),
            hot_cache_capacity: default_capacity(),
            hot_cache_ttl_secs: default_hot_cache_ttl_secs(),
            fingerprint_capacity: default_capacity(),
            bridge_bind: None,
            bridge_peers: Vec::new(),
            metrics_flush_secs: default_metrics_flush_secs(),
            metrics_frames: default_metrics_frames(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn metrics_flush_period(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_secs)
    }

    pub fn fingerprint_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.fingerprint_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Store settings derived from this configuration.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            root_dir: self.root_dir.clone(),
            max_body_bytes: self.max_body_bytes,
            hot_capacity: NonZeroUsize::new(self.hot_cache_capacity).unwrap_or(NonZeroUsize::MIN),
            hot_ttl: Duration::from_secs(self.hot_cache_ttl_secs),
        }
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `STAMPEDE_`
    /// 2. TOML file from `STAMPEDE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("STAMPEDE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("STAMPEDE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.root_dir.ends_with(".stampede"));
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.listen_addr, "127.0.0.1:3002".parse().unwrap());
        assert!(config.upstream.is_none());
        assert_eq!(config.max_body_bytes, 64 * 1024 * 1024);
        assert_eq!(config.hot_cache_capacity, 1000);
        assert_eq!(config.hot_cache_ttl_secs, 60);
        assert_eq!(config.fingerprint_capacity, 1000);
        assert!(config.bridge_bind.is_none());
        assert!(config.bridge_peers.is_empty());
    }

    #[test]
    fn test_timeout_duration() {
        let config = AppConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_store_config() {
        let config = AppConfig { hot_cache_capacity: 7, hot_cache_ttl_secs: 3, ..Default::default() };
        let store = config.store_config();
        assert_eq!(store.root_dir, config.root_dir);
        assert_eq!(store.hot_capacity.get(), 7);
        assert_eq!(store.hot_ttl, Duration::from_secs(3));
    }

    #[test]
    fn test_load_layers_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "stampede.toml",
                r#"
                root_dir = "/tmp/stampede-test"
                timeout_ms = 2500
                bridge_peers = ["127.0.0.1:7101", "127.0.0.1:7102"]
                "#,
            )?;
            jail.set_env("STAMPEDE_CONFIG_FILE", "stampede.toml");
            jail.set_env("STAMPEDE_TIMEOUT_MS", "3000");
            jail.set_env("STAMPEDE_UPSTREAM", "origin.internal:8080");

            let config = AppConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.root_dir, PathBuf::from("/tmp/stampede-test"));
            assert_eq!(config.timeout_ms, 3000);
            assert_eq!(config.upstream.as_deref(), Some("origin.internal:8080"));
            assert_eq!(config.bridge_peers.len(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("STAMPEDE_TIMEOUT_MS", "5");
            let result = AppConfig::load();
            assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "timeout_ms"));
            Ok(())
        });
    }
}
