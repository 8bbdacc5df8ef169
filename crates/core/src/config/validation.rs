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
    /// - any TTL is shorter than one day
    /// - `storage_target_bytes` is 0
    /// - `cleanup_threshold_ratio` is outside (0, 1]
    /// - `max_removals_per_run` is 0
    /// - `cleanup_interval_secs` is below one minute
    ///
    /// Returns `ConfigError::Missing` if `db_path` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                field: "db_path".into(),
                hint: "Set CHORDCACHE_DB_PATH environment variable".into(),
            });
        }

        if self.document_ttl_days == 0 {
            return Err(ConfigError::Invalid {
                field: "document_ttl_days".into(),
                reason: "must be at least 1 day".into(),
            });
        }
        if self.default_search_ttl_days == 0 {
            return Err(ConfigError::Invalid {
                field: "default_search_ttl_days".into(),
                reason: "must be at least 1 day".into(),
            });
        }
        if let Some((source, _)) = self.search_ttl_days.iter().find(|(_, days)| **days == 0) {
            return Err(ConfigError::Invalid {
                field: format!("search_ttl_days.{source}"),
                reason: "must be at least 1 day".into(),
            });
        }

        if self.storage_target_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "storage_target_bytes".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if !(self.cleanup_threshold_ratio > 0.0 && self.cleanup_threshold_ratio <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "cleanup_threshold_ratio".into(),
                reason: "must be in the range (0, 1]".into(),
            });
        }

        if self.max_removals_per_run == 0 {
            return Err(ConfigError::Invalid {
                field: "max_removals_per_run".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.cleanup_interval_secs < 60 {
            return Err(ConfigError::Invalid {
                field: "cleanup_interval_secs".into(),
                reason: "must be at least 60 seconds".into(),
            });
        }

        if let Some(quota) = self.quota_bytes
            && quota < self.storage_target_bytes
        {
            tracing::warn!(
                quota_bytes = quota,
                storage_target_bytes = self.storage_target_bytes,
                "quota_bytes is below storage_target_bytes; \
                 writes may fail before an eviction run is triggered"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_db_path() {
        let config = AppConfig { db_path: PathBuf::new(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Missing { field, .. }) if field == "db_path"));
    }

    #[test]
    fn test_validate_zero_document_ttl() {
        let config = AppConfig { document_ttl_days: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "document_ttl_days"));
    }

    #[test]
    fn test_validate_zero_source_ttl() {
        let mut config = AppConfig::default();
        config.search_ttl_days.insert("supabase".into(), 0);
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "search_ttl_days.supabase"));
    }

    #[test]
    fn test_validate_zero_target() {
        let config = AppConfig { storage_target_bytes: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "storage_target_bytes"));
    }

    #[test]
    fn test_validate_threshold_bounds() {
        for ratio in [0.0, -0.1, 1.01, f64::NAN] {
            let config = AppConfig { cleanup_threshold_ratio: ratio, ..Default::default() };
            let result = config.validate();
            assert!(
                matches!(result, Err(ConfigError::Invalid { ref field, .. }) if field == "cleanup_threshold_ratio"),
                "ratio {ratio} should be rejected"
            );
        }

        let config = AppConfig { cleanup_threshold_ratio: 1.0, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_removal_budget() {
        let config = AppConfig { max_removals_per_run: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "max_removals_per_run"));
    }

    #[test]
    fn test_validate_interval_too_small() {
        let config = AppConfig { cleanup_interval_secs: 59, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "cleanup_interval_secs"));
    }

    #[test]
    fn test_validate_small_quota_only_warns() {
        let config = AppConfig { quota_bytes: Some(1024), ..Default::default() };
        assert!(config.validate().is_ok());
    }
}
