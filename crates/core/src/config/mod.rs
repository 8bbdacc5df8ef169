//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (CHORDCACHE_*)
//! 2. TOML config file (if CHORDCACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (CHORDCACHE_*)
/// 2. TOML config file (if CHORDCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite cache database.
    ///
    /// Set via CHORDCACHE_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How long a cached (unsaved) document stays fresh.
    ///
    /// Set via CHORDCACHE_DOCUMENT_TTL_DAYS environment variable.
    #[serde(default = "default_document_ttl_days")]
    pub document_ttl_days: u32,

    /// Per data source TTL for search results, in days.
    ///
    /// Set via CHORDCACHE_SEARCH_TTL_DAYS__<SOURCE> environment variables.
    #[serde(default)]
    pub search_ttl_days: BTreeMap<String, u32>,

    /// TTL for search results from a source with no explicit entry.
    #[serde(default = "default_search_ttl_days")]
    pub default_search_ttl_days: u32,

    /// Storage budget the eviction engine measures usage against.
    ///
    /// Set via CHORDCACHE_STORAGE_TARGET_BYTES environment variable.
    #[serde(default = "default_storage_target_bytes")]
    pub storage_target_bytes: u64,

    /// Usage ratio above which an eviction run is triggered.
    #[serde(default = "default_cleanup_threshold_ratio")]
    pub cleanup_threshold_ratio: f64,

    /// Maximum number of records a single eviction run may remove.
    #[serde(default = "default_max_removals_per_run")]
    pub max_removals_per_run: usize,

    /// Period of the background eviction check.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Hard size cap enforced by SQLite itself (`max_page_count`).
    #[serde(default)]
    pub quota_bytes: Option<u64>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./chordcache.sqlite")
}

fn default_document_ttl_days() -> u32 {
    7
}

fn default_search_ttl_days() -> u32 {
    30
}

fn default_storage_target_bytes() -> u64 {
    150 * 1024 * 1024
}

fn default_cleanup_threshold_ratio() -> f64 {
    0.8
}

fn default_max_removals_per_run() -> usize {
    200
}

fn default_cleanup_interval_secs() -> u64 {
    DAY_SECS
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            document_ttl_days: default_document_ttl_days(),
            search_ttl_days: BTreeMap::new(),
            default_search_ttl_days: default_search_ttl_days(),
            storage_target_bytes: default_storage_target_bytes(),
            cleanup_threshold_ratio: default_cleanup_threshold_ratio(),
            max_removals_per_run: default_max_removals_per_run(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            quota_bytes: None,
        }
    }
}

impl AppConfig {
    /// TTL applied to cached documents.
    pub fn document_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.document_ttl_days))
    }

    /// TTL applied to search results from `data_source`.
    ///
    /// Sources are matched case-insensitively; unknown sources fall back
    /// to `default_search_ttl_days`.
    pub fn search_ttl(&self, data_source: &str) -> chrono::Duration {
        let days = self
            .search_ttl_days
            .iter()
            .find(|(source, _)| source.eq_ignore_ascii_case(data_source))
            .map(|(_, days)| *days)
            .unwrap_or(self.default_search_ttl_days);
        chrono::Duration::days(i64::from(days))
    }

    /// Eviction timer period as a Duration for use with tokio.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `CHORDCACHE_`
    /// 2. TOML file from `CHORDCACHE_CONFIG_FILE` (if set)
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

        if let Ok(config_path) = std::env::var("CHORDCACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("CHORDCACHE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
