//! Storage usage monitoring.
//!
//! Usage is measured against the configured `storage_target_bytes`, not the
//! hard quota, so eviction starts well before writes begin to fail. If the
//! estimate cannot be obtained the monitor assumes half the budget is used,
//! which never triggers a cleanup on its own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::connection::CacheDb;
use super::schema::Store;
use crate::Error;

/// Ratio assumed when no estimate is available.
pub const FALLBACK_USAGE_RATIO: f64 = 0.5;

/// Bytes used versus the budget they are measured against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageEstimate {
    pub used_bytes: u64,
    pub target_bytes: u64,
    /// False when this is the fallback rather than a measurement.
    pub measured: bool,
}

impl StorageEstimate {
    pub fn fallback(target_bytes: u64) -> Self {
        Self { used_bytes: (target_bytes as f64 * FALLBACK_USAGE_RATIO) as u64, target_bytes, measured: false }
    }

    pub fn ratio(&self) -> f64 {
        if self.target_bytes == 0 {
            return FALLBACK_USAGE_RATIO;
        }
        self.used_bytes as f64 / self.target_bytes as f64
    }
}

/// Source of the used-bytes figure.
#[async_trait]
pub trait UsageProbe: Send + Sync {
    /// Bytes currently used by the cache.
    async fn used_bytes(&self, db: &CacheDb) -> Result<u64, Error>;
}

/// Measures live SQLite pages: `(page_count - freelist_count) * page_size`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageCountUsage;

#[async_trait]
impl UsageProbe for PageCountUsage {
    async fn used_bytes(&self, db: &CacheDb) -> Result<u64, Error> {
        db.read_once(Store::DocumentMetadata, |tx| {
            let page_count: i64 = tx.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let freelist: i64 = tx.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
            let page_size: i64 = tx.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            Ok(((page_count - freelist).max(0) * page_size) as u64)
        })
        .await
    }
}

impl CacheDb {
    /// Current usage estimate. Never fails: probe errors degrade to the fallback.
    pub async fn storage_estimate(&self) -> StorageEstimate {
        let target_bytes = self.config().storage_target_bytes;
        match self.inner.usage_probe.used_bytes(self).await {
            Ok(used_bytes) => StorageEstimate { used_bytes, target_bytes, measured: true },
            Err(e) => {
                tracing::warn!(error = %e, "storage estimate unavailable; assuming {FALLBACK_USAGE_RATIO} usage");
                StorageEstimate::fallback(target_bytes)
            }
        }
    }

    /// Used bytes divided by the storage target.
    pub async fn usage_ratio(&self) -> f64 {
        self.storage_estimate().await.ratio()
    }

    /// Whether usage is above the cleanup threshold.
    pub async fn should_cleanup(&self) -> bool {
        self.usage_ratio().await > self.config().cleanup_threshold_ratio
    }

    /// Whether writing `estimated_bytes` more would push usage over the threshold.
    ///
    /// Advisory only: another write may land between this check and the
    /// caller's own write.
    pub async fn would_exceed_after_write(&self, estimated_bytes: u64) -> bool {
        let estimate = self.storage_estimate().await;
        let after = StorageEstimate { used_bytes: estimate.used_bytes.saturating_add(estimated_bytes), ..estimate };
        after.ratio() > self.config().cleanup_threshold_ratio
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Reports a settable figure.
    #[derive(Debug, Clone, Default)]
    pub struct FixedUsage(pub Arc<AtomicU64>);

    impl FixedUsage {
        pub fn new(used_bytes: u64) -> Self {
            Self(Arc::new(AtomicU64::new(used_bytes)))
        }

        pub fn set(&self, used_bytes: u64) {
            self.0.store(used_bytes, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl UsageProbe for FixedUsage {
        async fn used_bytes(&self, _db: &CacheDb) -> Result<u64, Error> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    /// Always fails, like a platform without a storage estimate API.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UnavailableUsage;

    #[async_trait]
    impl UsageProbe for UnavailableUsage {
        async fn used_bytes(&self, _db: &CacheDb) -> Result<u64, Error> {
            Err(Error::InvalidInput("storage estimate not supported".into()))
        }
    }
}
