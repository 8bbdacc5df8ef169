//! cache_get tool implementation.
//!
//! Reads a cached chord sheet by artist and title.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use chordcache_core::{CacheDb, Document};

use super::json_result;

fn default_include_body() -> bool {
    true
}

/// Parameters for the cache_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheGetParams {
    pub artist: String,
    pub title: String,

    /// Return the chord sheet body along with its metadata.
    #[serde(default = "default_include_body")]
    pub include_body: bool,
}

/// Output from the cache_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheGetOutput {
    /// False on a miss, including expired cached documents.
    pub found: bool,
    pub document: Option<Document>,
}

/// Implementation of the cache_get tool.
///
/// A full read counts as an access; a metadata-only read does not.
pub async fn get_impl(cache: &CacheDb, params: CacheGetParams) -> Result<CallToolResult, McpError> {
    let document = if params.include_body {
        cache.get_document(&params.artist, &params.title).await?
    } else {
        cache
            .get_document_metadata(&params.artist, &params.title)
            .await?
            .map(|metadata| Document { metadata, body: None })
    };

    json_result(&CacheGetOutput { found: document.is_some(), document })
}
