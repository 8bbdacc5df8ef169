//! Cache-related MCP tools.
//!
//! Each tool is a thin `*_impl` function over [`CacheDb`] so it can be tested
//! without a transport.

use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;

use chordcache_core::Error;

pub mod cleanup;
pub mod get;
pub mod list;
pub mod purge;
pub mod save;
pub mod search;

pub use cleanup::{CacheCleanupParams, cleanup_impl, stats_impl};
pub use get::{CacheGetParams, get_impl};
pub use list::{CacheListParams, list_impl};
pub use purge::{CacheDeleteParams, CachePurgeParams, delete_impl, purge_impl};
pub use save::{CacheSaveParams, CacheUnsaveParams, save_impl, unsave_impl};
pub use search::{CacheSearchGetParams, search_get_impl};

/// Serialize a tool output as pretty JSON text content.
pub(crate) fn json_result<T: Serialize>(output: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(output)
        .map_err(|e| Error::InvalidInput(format!("Failed to serialize output: {e}")))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[cfg(test)]
pub(crate) fn decode<T: serde::de::DeserializeOwned>(result: &CallToolResult) -> T {
    let content_val = serde_json::to_value(&result.content[0]).unwrap();
    let text = content_val
        .get("text")
        .and_then(|v| v.as_str())
        .expect("Expected text field in content");
    serde_json::from_str(text).unwrap()
}
