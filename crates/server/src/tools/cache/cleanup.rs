//! cache_cleanup and cache_stats tool implementations.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use chordcache_core::cache::CleanupMode;
use chordcache_core::{CacheDb, CleanupReport};

use super::json_result;

/// Parameters for the cache_cleanup tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CacheCleanupParams {
    /// Evict even when usage is under the threshold, up to the per-run
    /// removal budget. Saved documents are never evicted.
    #[serde(default)]
    pub force: bool,
}

/// Output from the cache_cleanup tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheCleanupOutput {
    pub report: CleanupReport,
}

/// Implementation of the cache_cleanup tool.
pub async fn cleanup_impl(cache: &CacheDb, params: CacheCleanupParams) -> Result<CallToolResult, McpError> {
    let mode = if params.force { CleanupMode::Force { bytes_needed: u64::MAX } } else { CleanupMode::IfNeeded };
    let report = cache.run_cleanup(mode).await?;
    json_result(&CacheCleanupOutput { report })
}

/// Implementation of the cache_stats tool.
pub async fn stats_impl(cache: &CacheDb) -> Result<CallToolResult, McpError> {
    let stats = cache.stats().await?;
    json_result(&stats)
}
