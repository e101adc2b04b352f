//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `max_body_bytes`, a cache capacity or the metrics settings are 0
    /// - `upstream` is set but empty
    ///
    /// Returns `ConfigError::Missing` if `root_dir` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                field: "root_dir".into(),
                hint: "Set STAMPEDE_ROOT_DIR environment variable".into(),
            });
        }

        if self.timeout_ms < 100 {
            return Err(ConfigError::Invalid { field: "timeout_ms".into(), reason: "must be at least 100ms".into() });
        }
        if self.timeout_ms > 300_000 {
            return Err(ConfigError::Invalid {
                field: "timeout_ms".into(),
                reason: "must not exceed 5 minutes (300000ms)".into(),
            });
        }

        for (field, value) in [
            ("max_body_bytes", self.max_body_bytes),
            ("hot_cache_capacity", self.hot_cache_capacity),
            ("fingerprint_capacity", self.fingerprint_capacity),
            ("metrics_frames", self.metrics_frames),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid { field: field.into(), reason: "must be greater than 0".into() });
            }
        }

        if self.metrics_flush_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "metrics_flush_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.upstream.as_deref().is_some_and(|u| u.trim().is_empty()) {
            return Err(ConfigError::Invalid { field: "upstream".into(), reason: "must not be empty".into() });
        }

        if self.bridge_bind.is_none() && !self.bridge_peers.is_empty() {
            tracing::warn!(
                peer_count = self.bridge_peers.len(),
                "bridge_peers is set without bridge_bind; \
                 purges will be sent but sibling purges will not be received"
            );
        }

        Ok(())
    }
}
