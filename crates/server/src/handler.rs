//! MCP server handler implementation.
//!
//! This module defines the main server handler that
//! routes tool calls to the appropriate implementations.
use crate::tools::cache::{
    CacheCleanupParams, CacheDeleteParams, CacheGetParams, CacheListParams, CachePurgeParams, CacheSaveParams,
    CacheSearchGetParams, CacheUnsaveParams, cleanup_impl, delete_impl, get_impl, list_impl, purge_impl, save_impl,
    search_get_impl, stats_impl, unsave_impl,
};

use chordcache_core::CacheDb;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{
        tool::{ToolCallContext, ToolRouter},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};

/// The main MCP server handler for chordcache.
#[derive(Clone)]
pub struct ChordCacheServer {
    cache: CacheDb,
    tool_router: ToolRouter<Self>,
}

/// Tool router implementation using the #[tool_router] macro.
///
/// This macro generates the routing logic that maps tool names to handler methods.
#[tool_router]
impl ChordCacheServer {
    /// Create a new server handler over an open cache.
    pub fn new(cache: CacheDb) -> Self {
        Self { cache, tool_router: Self::tool_router() }
    }

    #[tool(description = "Read a cached chord sheet by artist and title. Expired cached sheets read as a miss.")]
    async fn cache_get(&self, params: Parameters<CacheGetParams>) -> Result<CallToolResult, McpError> {
        get_impl(&self.cache, params.0).await
    }

    #[tool(description = "List cached chord sheets (metadata only), optionally only the saved ones.")]
    async fn cache_list(&self, params: Parameters<CacheListParams>) -> Result<CallToolResult, McpError> {
        list_impl(&self.cache, params.0).await
    }

    #[tool(description = "Save a chord sheet so it is never expired or evicted. Omit the body to save one already cached.")]
    async fn cache_save(&self, params: Parameters<CacheSaveParams>) -> Result<CallToolResult, McpError> {
        save_impl(&self.cache, params.0).await
    }

    #[tool(description = "Unsave a chord sheet. It stays cached and expires one TTL from now.")]
    async fn cache_unsave(&self, params: Parameters<CacheUnsaveParams>) -> Result<CallToolResult, McpError> {
        unsave_impl(&self.cache, params.0).await
    }

    #[tool(description = "Delete a chord sheet, saved or not.")]
    async fn cache_delete(&self, params: Parameters<CacheDeleteParams>) -> Result<CallToolResult, McpError> {
        delete_impl(&self.cache, params.0).await
    }

    #[tool(description = "Look up cached search results for a set of query parameters.")]
    async fn cache_search_get(&self, params: Parameters<CacheSearchGetParams>) -> Result<CallToolResult, McpError> {
        search_get_impl(&self.cache, params.0).await
    }

    #[tool(description = "Purge expired entries, or clear all search results or all documents.")]
    async fn cache_purge(&self, params: Parameters<CachePurgeParams>) -> Result<CallToolResult, McpError> {
        purge_impl(&self.cache, params.0).await
    }

    #[tool(description = "Run priority-based eviction now. Saved chord sheets are never evicted.")]
    async fn cache_cleanup(&self, params: Parameters<CacheCleanupParams>) -> Result<CallToolResult, McpError> {
        cleanup_impl(&self.cache, params.0).await
    }

    #[tool(description = "Show document and search entry counts and the current storage usage estimate.")]
    async fn cache_stats(&self) -> Result<CallToolResult, McpError> {
        stats_impl(&self.cache).await
    }
}

impl ServerHandler for ChordCacheServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "chordcache".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self, _request: Option<PaginatedRequestParam>, _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, rmcp::model::ErrorData> {
        Ok(ListToolsResult { meta: None, tools: self.tool_router.list_all(), next_cursor: None })
    }

    async fn call_tool(
        &self, request: CallToolRequestParam, context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::model::ErrorData> {
        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}
