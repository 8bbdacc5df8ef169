//! Search cache operations.
//!
//! Result sets are keyed by their normalized query parameters and always
//! expire, with a TTL chosen by data source. Search entries are never saved.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio_rusqlite::params;

use super::connection::CacheDb;
use super::executor::{clear, delete, get, get_all, put};
use super::key::search_key;
use super::records::{SearchCacheEntry, SearchStorageInfo, StoredRecord, to_millis};
use super::schema::Store;
use crate::Error;

/// Query parameters as sent to the search API.
pub type SearchQuery = BTreeMap<String, String>;

impl CacheDb {
    /// Cache a result set under the key derived from `query`.
    ///
    /// Overwrites any previous entry for the same normalized query and
    /// restarts its TTL.
    pub async fn store_results(
        &self, query: SearchQuery, result_type: &str, data_source: &str, results: Vec<serde_json::Value>,
    ) -> Result<SearchCacheEntry, Error> {
        let now = Utc::now();
        let entry = SearchCacheEntry {
            key: search_key(&query),
            query,
            result_type: result_type.to_string(),
            data_source: data_source.to_string(),
            results,
            storage: SearchStorageInfo::new(now, self.config().search_ttl(data_source)),
        };
        let estimated = entry.estimated_size() as u64;
        self.admit_write(estimated).await;

        self.with_quota_retry(estimated.saturating_mul(2), || {
            let entry = entry.clone();
            self.write_once(Store::SearchCache, move |tx| put(tx, &entry))
        })
        .await?;
        tracing::debug!(key = %entry.key, results = entry.results.len(), source = %entry.data_source, "cached search results");
        Ok(entry)
    }

    /// Look up cached results for `query`.
    ///
    /// With `validate_ttl` an expired entry reads as a miss; without it the
    /// stale entry is returned as-is, e.g. for offline fallback. A validated
    /// miss does not delete the expired row: it must stay readable with
    /// `validate_ttl = false`. Expired entries are removed by
    /// [`Self::purge_expired_search`] or by eviction, where they rank first.
    pub async fn get_results(&self, query: &SearchQuery, validate_ttl: bool) -> Result<Option<SearchCacheEntry>, Error> {
        let key = search_key(query);
        let now = Utc::now();
        let entry = self.read_once(Store::SearchCache, move |tx| get::<SearchCacheEntry>(tx, &key)).await?;
        Ok(entry.filter(|e| !validate_ttl || !e.is_expired(now)))
    }

    /// Check if a fresh (unexpired) entry exists for `query`.
    pub async fn is_search_fresh(&self, query: &SearchQuery) -> Result<bool, Error> {
        let key = search_key(query);
        let now = to_millis(Utc::now());
        self.read_once(Store::SearchCache, move |tx| {
            let fresh: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM search_cache WHERE key = ?1 AND expires_at >= ?2)",
                params![key, now],
                |row| row.get(0),
            )?;
            Ok(fresh)
        })
        .await
    }

    /// Every cached search entry, expired ones included, ordered by key.
    pub async fn list_search_entries(&self) -> Result<Vec<SearchCacheEntry>, Error> {
        self.read_once(Store::SearchCache, |tx| get_all::<SearchCacheEntry>(tx)).await
    }

    /// Drop the entry for `query`. Returns whether one existed.
    pub async fn delete_results(&self, query: &SearchQuery) -> Result<bool, Error> {
        let key = search_key(query);
        self.write_once(Store::SearchCache, move |tx| delete(tx, Store::SearchCache, &key)).await
    }

    /// Drop every cached search entry.
    pub async fn clear_search_cache(&self) -> Result<u64, Error> {
        self.write_once(Store::SearchCache, |tx| clear(tx, Store::SearchCache)).await
    }

    /// Delete search entries past their TTL as of `now`.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_expired_search(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let now = to_millis(now);
        let purged = self
            .write_once(Store::SearchCache, move |tx| {
                let count = tx.execute("DELETE FROM search_cache WHERE expires_at < ?1", params![now])?;
                Ok(count as u64)
            })
            .await?;
        if purged > 0 {
            tracing::info!(purged, "purged expired search results");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use chrono::Duration;
    use serde_json::json;

    fn query(pairs: &[(&str, &str)]) -> SearchQuery {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn expire(db: &CacheDb, query: &SearchQuery) {
        let key = search_key(query);
        let mut entry = db.collection::<SearchCacheEntry>().get(&key).await.unwrap().unwrap();
        let then = Utc::now() - Duration::days(31);
        entry.storage = SearchStorageInfo::new(then, Duration::days(30));
        db.collection::<SearchCacheEntry>().put(entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_and_get_results() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let q = query(&[("artist", "Hillsong"), ("title", "Oceans")]);
        db.store_results(q.clone(), "songs", "supabase", vec![json!({"title": "Oceans"})]).await.unwrap();

        let entry = db.get_results(&q, true).await.unwrap().unwrap();
        assert_eq!(entry.key, "search/artist=hillsong&title=oceans");
        assert_eq!(entry.results, vec![json!({"title": "Oceans"})]);
        assert_eq!(entry.query, q);
    }

    #[tokio::test]
    async fn test_equivalent_queries_share_entry() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.store_results(query(&[("Artist", "Hillsong United")]), "songs", "supabase", vec![json!(1)])
            .await
            .unwrap();

        let hit = db.get_results(&query(&[("artist", "hillsong  united")]), true).await.unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn test_get_missing_search() {
        let db = CacheDb::open_in_memory().await.unwrap();
        assert!(db.get_results(&query(&[("q", "nothing")]), true).await.unwrap().is_none());
        assert!(!db.is_search_fresh(&query(&[("q", "nothing")])).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_entry_only_without_validation() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let q = query(&[("artist", "hillsong")]);
        db.store_results(q.clone(), "songs", "supabase", vec![json!({"title": "Oceans"})]).await.unwrap();
        expire(&db, &q).await;

        let stale = db.get_results(&q, false).await.unwrap();
        assert!(stale.is_some());
        assert!(db.get_results(&q, true).await.unwrap().is_none());
        assert!(!db.is_search_fresh(&q).await.unwrap());
        db.settle().await;
        assert_eq!(db.list_search_entries().await.unwrap().len(), 1);
        assert!(db.get_results(&q, false).await.unwrap().is_some());
        assert_eq!(db.purge_expired_search(Utc::now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_follows_data_source() {
        let mut config = AppConfig::default();
        config.search_ttl_days.insert("supabase".into(), 2);
        let db = CacheDb::builder(config).in_memory().open().await.unwrap();

        let entry = db.store_results(query(&[("q", "a")]), "songs", "Supabase", vec![]).await.unwrap();
        assert_eq!(entry.storage.expires_at - entry.storage.timestamp, Duration::days(2));

        let entry = db.store_results(query(&[("q", "b")]), "songs", "other", vec![]).await.unwrap();
        assert_eq!(entry.storage.expires_at - entry.storage.timestamp, Duration::days(30));
    }

    #[tokio::test]
    async fn test_purge_expired_search() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let expiring = query(&[("q", "expiring")]);
        let fresh = query(&[("q", "fresh")]);
        db.store_results(expiring.clone(), "songs", "supabase", vec![]).await.unwrap();
        db.store_results(fresh.clone(), "songs", "supabase", vec![]).await.unwrap();
        expire(&db, &expiring).await;

        let deleted = db.purge_expired_search(Utc::now()).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(db.get_results(&expiring, false).await.unwrap().is_none());
        assert!(db.get_results(&fresh, true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upsert_search() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let q = query(&[("q", "upsert")]);
        db.store_results(q.clone(), "songs", "supabase", vec![json!({"old": 1})]).await.unwrap();
        db.store_results(q.clone(), "songs", "supabase", vec![json!({"new": 2})]).await.unwrap();

        let entry = db.get_results(&q, true).await.unwrap().unwrap();
        assert_eq!(entry.results, vec![json!({"new": 2})]);
        assert_eq!(db.list_search_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_clear_search() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let a = query(&[("q", "a")]);
        db.store_results(a.clone(), "songs", "supabase", vec![]).await.unwrap();
        db.store_results(query(&[("q", "b")]), "artists", "supabase", vec![]).await.unwrap();

        assert!(db.delete_results(&a).await.unwrap());
        assert!(!db.delete_results(&a).await.unwrap());
        assert_eq!(db.clear_search_cache().await.unwrap(), 1);
    }
}
