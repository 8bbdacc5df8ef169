//! cache_save and cache_unsave tool implementations.
//!
//! Saving with a body stores (or refreshes) the sheet and keeps it until
//! explicitly unsaved or deleted. Saving without a body promotes a document
//! that is already cached.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use chordcache_core::{CacheDb, ChordSheet, DocumentMetadata, Error};

use super::json_result;

/// Parameters for the cache_save tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheSaveParams {
    pub artist: String,
    pub title: String,

    /// Chord sheet text. Omit to save an already cached document.
    pub body: Option<String>,

    /// Musical key, e.g. "G" or "F#m".
    pub song_key: Option<String>,
    pub tuning: Option<String>,
    pub capo: Option<u8>,
}

/// Parameters for the cache_unsave tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheUnsaveParams {
    pub artist: String,
    pub title: String,
}

/// Output from the cache_save and cache_unsave tools.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheSaveOutput {
    pub metadata: DocumentMetadata,
}

/// Implementation of the cache_save tool.
pub async fn save_impl(cache: &CacheDb, params: CacheSaveParams) -> Result<CallToolResult, McpError> {
    let metadata = match params.body {
        Some(body) => {
            let sheet = ChordSheet {
                artist: params.artist,
                title: params.title,
                song_key: params.song_key,
                tuning: params.tuning,
                capo: params.capo,
                body,
            };
            cache.save_document(sheet).await?
        }
        None => cache.save_existing(&params.artist, &params.title).await?.ok_or_else(|| {
            Error::InvalidInput(format!(
                "No cached document for {} / {}; provide a body to save it",
                params.artist, params.title
            ))
        })?,
    };

    json_result(&CacheSaveOutput { metadata })
}

/// Implementation of the cache_unsave tool.
pub async fn unsave_impl(cache: &CacheDb, params: CacheUnsaveParams) -> Result<CallToolResult, McpError> {
    let metadata = cache
        .unsave_document(&params.artist, &params.title)
        .await?
        .ok_or_else(|| Error::InvalidInput(format!("No document for {} / {}", params.artist, params.title)))?;

    json_result(&CacheSaveOutput { metadata })
}
