//! cache_list tool implementation.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use chordcache_core::{CacheDb, DocumentMetadata};

use super::json_result;

/// Parameters for the cache_list tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CacheListParams {
    /// Only list documents the user saved.
    #[serde(default)]
    pub saved_only: bool,
}

/// Output from the cache_list tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheListOutput {
    pub count: usize,
    pub documents: Vec<DocumentMetadata>,
}

/// Implementation of the cache_list tool. Bodies are never loaded.
pub async fn list_impl(cache: &CacheDb, params: CacheListParams) -> Result<CallToolResult, McpError> {
    let documents =
        if params.saved_only { cache.list_saved_documents().await? } else { cache.list_documents().await? };
    json_result(&CacheListOutput { count: documents.len(), documents })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::cache::decode;
    use chordcache_core::ChordSheet;

    #[tokio::test]
    async fn test_list_all_and_saved() {
        let cache = CacheDb::open_in_memory().await.unwrap();
        let sheet = |title: &str| ChordSheet { artist: "Blur".into(), title: title.into(), body: "x".into(), ..Default::default() };
        cache.cache_document(sheet("Song 2")).await.unwrap();
        cache.save_document(sheet("Parklife")).await.unwrap();

        let all: CacheListOutput = decode(&list_impl(&cache, CacheListParams::default()).await.unwrap());
        assert_eq!(all.count, 2);

        let saved: CacheListOutput = decode(&list_impl(&cache, CacheListParams { saved_only: true }).await.unwrap());
        assert_eq!(saved.count, 1);
        assert_eq!(saved.documents[0].key, "blur/parklife");
    }
}
