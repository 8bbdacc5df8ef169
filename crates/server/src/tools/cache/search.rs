//! cache_search_get tool implementation.
//!
//! Looks up cached search results for a set of query parameters.

use std::collections::BTreeMap;

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use chordcache_core::{CacheDb, SearchCacheEntry};

use super::json_result;

fn default_validate_ttl() -> bool {
    true
}

/// Parameters for the cache_search_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheSearchGetParams {
    /// Query parameters as sent to the search API, e.g. {"artist": "Hillsong"}.
    pub query: BTreeMap<String, String>,

    /// Treat expired results as a miss. Disable to get stale results for
    /// offline use.
    #[serde(default = "default_validate_ttl")]
    pub validate_ttl: bool,
}

/// Output from the cache_search_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheSearchGetOutput {
    pub found: bool,
    /// True when the returned entry is past its TTL.
    pub stale: bool,
    pub entry: Option<SearchCacheEntry>,
}

/// Implementation of the cache_search_get tool.
pub async fn search_get_impl(cache: &CacheDb, params: CacheSearchGetParams) -> Result<CallToolResult, McpError> {
    let entry = cache.get_results(&params.query, params.validate_ttl).await?;
    let now = chrono::Utc::now();
    let output = CacheSearchGetOutput {
        found: entry.is_some(),
        stale: entry.as_ref().is_some_and(|e| e.is_expired(now)),
        entry,
    };
    json_result(&output)
}
