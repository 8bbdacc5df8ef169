//! Housekeeping entry points and the cache summary.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::connection::CacheDb;
use super::executor::count;
use super::records::to_millis;
use super::schema::Store;
use super::usage::StorageEstimate;
use crate::Error;

/// Counts removed by [`CacheDb::purge_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub documents: u64,
    pub search_entries: u64,
}

/// Point-in-time summary of what the cache holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub saved_documents: u64,
    pub cached_documents: u64,
    /// Cached documents already past their TTL but not yet removed.
    pub expired_documents: u64,
    pub search_entries: u64,
    pub expired_search_entries: u64,
    pub usage: StorageEstimate,
    pub usage_ratio: f64,
    pub cleanup_threshold_ratio: f64,
}

impl CacheDb {
    /// Delete every expired cached document and search entry now.
    pub async fn purge_expired(&self) -> Result<PurgeReport, Error> {
        let now = Utc::now();
        Ok(PurgeReport {
            documents: self.purge_expired_documents(now).await?,
            search_entries: self.purge_expired_search(now).await?,
        })
    }

    pub async fn stats(&self) -> Result<CacheStats, Error> {
        let now = to_millis(Utc::now());
        let (saved_documents, cached_documents, expired_documents, search_entries, expired_search_entries) = self
            .read_once(Store::DocumentMetadata, move |tx| {
                let expired_docs = format!("saved = 0 AND expires_at IS NOT NULL AND expires_at < {now}");
                let expired_search = format!("expires_at < {now}");
                Ok((
                    count(tx, Store::DocumentMetadata, Some("saved = 1"))?,
                    count(tx, Store::DocumentMetadata, Some("saved = 0"))?,
                    count(tx, Store::DocumentMetadata, Some(expired_docs.as_str()))?,
                    count(tx, Store::SearchCache, None)?,
                    count(tx, Store::SearchCache, Some(expired_search.as_str()))?,
                ))
            })
            .await?;
        let usage = self.storage_estimate().await;

        Ok(CacheStats {
            saved_documents,
            cached_documents,
            expired_documents,
            search_entries,
            expired_search_entries,
            usage_ratio: usage.ratio(),
            usage,
            cleanup_threshold_ratio: self.config().cleanup_threshold_ratio,
        })
    }
}
