//! cache_delete and cache_purge tool implementations.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use chordcache_core::{CacheDb, Error};

use super::json_result;

/// Parameters for the cache_delete tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheDeleteParams {
    pub artist: String,
    pub title: String,
}

/// Output from the cache_delete tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheDeleteOutput {
    pub deleted: bool,
}

/// Parameters for the cache_purge tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeParams {
    /// Remove expired cached documents and search results.
    #[serde(default)]
    pub expired: bool,

    /// Remove every cached search result, fresh or not.
    #[serde(default)]
    pub all_search: bool,

    /// Remove every document, saved ones included.
    #[serde(default)]
    pub all_documents: bool,
}

/// Output from the cache_purge tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeOutput {
    pub documents_deleted: u64,
    pub search_deleted: u64,
}

/// Implementation of the cache_delete tool. Deletes saved documents too.
pub async fn delete_impl(cache: &CacheDb, params: CacheDeleteParams) -> Result<CallToolResult, McpError> {
    let deleted = cache.delete_document(&params.artist, &params.title).await?;
    json_result(&CacheDeleteOutput { deleted })
}

/// Implementation of the cache_purge tool.
pub async fn purge_impl(cache: &CacheDb, params: CachePurgeParams) -> Result<CallToolResult, McpError> {
    if !params.expired && !params.all_search && !params.all_documents {
        return Err(
            Error::InvalidInput("At least one of expired, all_search, or all_documents must be set".to_string()).into()
        );
    }

    let mut output = CachePurgeOutput::default();

    if params.expired {
        let purged = cache.purge_expired().await?;
        output.documents_deleted += purged.documents;
        output.search_deleted += purged.search_entries;
    }

    if params.all_search {
        output.search_deleted += cache.clear_search_cache().await?;
    }

    if params.all_documents {
        output.documents_deleted += cache.clear_documents().await?;
    }

    json_result(&output)
}
