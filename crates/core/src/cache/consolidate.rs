//! Duplicate consolidation onto canonical keys.
//!
//! Records written under the old flat key scheme and under the path scheme
//! can describe the same song. This sweep groups documents by the canonical
//! key of their artist and title, keeps one record per group, and moves the
//! survivor under the canonical key.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_rusqlite::rusqlite;

use super::connection::CacheDb;
use super::executor::{delete, get, get_all, put};
use super::key::{resolve_legacy_key, try_document_key};
use super::records::{DocumentContent, DocumentMetadata};
use super::schema::Store;
use crate::Error;

/// Outcome of a consolidation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    /// Canonical keys that had more than one record.
    pub duplicate_groups: usize,
    /// Records deleted as duplicates.
    pub removed: usize,
    /// Survivors moved from a non-canonical key.
    pub rekeyed: usize,
    /// Records with no derivable canonical key, left untouched.
    pub unresolved: usize,
}

/// Which of two duplicates to keep: saved beats cached, then more reads,
/// then the newer first-stored timestamp.
pub fn keep_preference(a: &DocumentMetadata, b: &DocumentMetadata) -> Ordering {
    a.storage
        .saved
        .cmp(&b.storage.saved)
        .then(a.storage.access_count.cmp(&b.storage.access_count))
        .then(a.storage.timestamp.cmp(&b.storage.timestamp))
}

fn canonical_key_for(record: &DocumentMetadata) -> Option<String> {
    try_document_key(&record.artist, &record.title).or_else(|| resolve_legacy_key(&record.key))
}

fn remove_document(conn: &rusqlite::Connection, key: &str) -> Result<(), Error> {
    delete(conn, Store::DocumentContent, key)?;
    delete(conn, Store::DocumentMetadata, key)?;
    Ok(())
}

fn rekey(conn: &rusqlite::Connection, mut keeper: DocumentMetadata, canonical: &str) -> Result<(), Error> {
    let content = get::<DocumentContent>(conn, &keeper.key)?;
    remove_document(conn, &keeper.key)?;

    keeper.key = canonical.to_string();
    keeper.storage.content_available = content.is_some();
    put(conn, &keeper)?;
    if let Some(mut content) = content {
        content.key = canonical.to_string();
        put(conn, &content)?;
    }
    Ok(())
}

/// Run the sweep inside the caller's transaction.
pub(crate) fn consolidate(conn: &rusqlite::Connection) -> Result<ConsolidationReport, Error> {
    let mut report = ConsolidationReport::default();
    let mut groups: BTreeMap<String, Vec<DocumentMetadata>> = BTreeMap::new();

    for record in get_all::<DocumentMetadata>(conn)? {
        match canonical_key_for(&record) {
            Some(canonical) => groups.entry(canonical).or_default().push(record),
            None => {
                tracing::warn!(key = %record.key, "no canonical key for document; leaving it in place");
                report.unresolved += 1;
            }
        }
    }

    for (canonical, mut members) in groups {
        if members.len() > 1 {
            report.duplicate_groups += 1;
        }
        members.sort_by(|a, b| keep_preference(b, a));

        let mut members = members.into_iter();
        let Some(keeper) = members.next() else {
            continue;
        };
        for duplicate in members {
            tracing::debug!(key = %duplicate.key, kept = %keeper.key, "removing duplicate document");
            remove_document(conn, &duplicate.key)?;
            report.removed += 1;
        }

        if keeper.key != canonical {
            tracing::debug!(from = %keeper.key, to = %canonical, "moving document to canonical key");
            rekey(conn, keeper, &canonical)?;
            report.rekeyed += 1;
        }
    }

    if report.removed > 0 || report.rekeyed > 0 {
        tracing::info!(
            groups = report.duplicate_groups,
            removed = report.removed,
            rekeyed = report.rekeyed,
            "consolidated document keys"
        );
    }
    Ok(report)
}

impl CacheDb {
    /// Collapse documents that share a canonical key into one record each.
    ///
    /// Runs once automatically as part of migrations; calling it again is
    /// harmless and finds nothing to do unless new duplicates were written
    /// through the raw collection API.
    pub async fn consolidate_duplicates(&self) -> Result<ConsolidationReport, Error> {
        self.write_once(Store::DocumentMetadata, |tx| consolidate(tx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::records::StorageInfo;
    use chrono::{Duration, Utc};

    fn record(key: &str, artist: &str, title: &str, saved: bool, access_count: u32, age_days: i64) -> DocumentMetadata {
        let at = Utc::now() - Duration::days(age_days);
        let mut storage = if saved { StorageInfo::new_saved(at) } else { StorageInfo::new_cached(at, Duration::days(7)) };
        storage.access_count = access_count;
        DocumentMetadata {
            key: key.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            song_key: None,
            tuning: None,
            capo: None,
            storage,
        }
    }

    async fn seed(db: &CacheDb, records: Vec<DocumentMetadata>) {
        for r in records {
            let key = r.key.clone();
            db.collection::<DocumentMetadata>().put(r).await.unwrap();
            db.collection::<DocumentContent>()
                .put(DocumentContent { key: key.clone(), body: format!("body of {key}") })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_duplicates_reduce_to_saved_record() {
        let db = CacheDb::open_in_memory().await.unwrap();
        seed(
            &db,
            vec![
                record("jose_gonzalez_heartbeats", "Jose Gonzalez", "Heartbeats", false, 40, 1),
                record("jose-gonzalez_heartbeats", "José González", "Heartbeats", true, 1, 30),
                record("jose-gonzalez/heartbeats", "JOSÉ GONZÁLEZ", "heartbeats", false, 2, 0),
            ],
        )
        .await;

        let report = db.consolidate_duplicates().await.unwrap();
        assert_eq!(report.duplicate_groups, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(report.rekeyed, 1);

        let all = db.collection::<DocumentMetadata>().get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "jose-gonzalez/heartbeats");
        assert!(all[0].storage.saved);

        let content = db.collection::<DocumentContent>().get("jose-gonzalez/heartbeats").await.unwrap().unwrap();
        assert_eq!(content.body, "body of jose-gonzalez_heartbeats");
        assert_eq!(db.collection::<DocumentContent>().get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_without_saved_prefers_access_count_then_timestamp() {
        let db = CacheDb::open_in_memory().await.unwrap();
        seed(
            &db,
            vec![
                record("oasis_wonderwall", "Oasis", "Wonderwall", false, 5, 10),
                record("oasis-_wonderwall", "oasis", "wonderwall", false, 5, 1),
                record("Oasis_Wonderwall", "OASIS", "Wonderwall!", false, 2, 0),
            ],
        )
        .await;

        db.consolidate_duplicates().await.unwrap();
        let all = db.collection::<DocumentMetadata>().get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "oasis/wonderwall");
        assert_eq!(all[0].storage.access_count, 5);
        let content = db.collection::<DocumentContent>().get("oasis/wonderwall").await.unwrap().unwrap();
        assert_eq!(content.body, "body of oasis-_wonderwall");
    }

    #[tokio::test]
    async fn test_second_sweep_is_noop() {
        let db = CacheDb::open_in_memory().await.unwrap();
        seed(&db, vec![record("blur_song-2", "Blur", "Song 2", false, 0, 0)]).await;

        let first = db.consolidate_duplicates().await.unwrap();
        assert_eq!(first.rekeyed, 1);
        let second = db.consolidate_duplicates().await.unwrap();
        assert_eq!(second, ConsolidationReport::default());
    }

    #[tokio::test]
    async fn test_unresolvable_records_left_alone() {
        let db = CacheDb::open_in_memory().await.unwrap();
        seed(&db, vec![record("???", "", "", false, 0, 0)]).await;

        let report = db.consolidate_duplicates().await.unwrap();
        assert_eq!(report.unresolved, 1);
        assert!(db.collection::<DocumentMetadata>().get("???").await.unwrap().is_some());
    }

    #[test]
    fn test_keep_preference_order() {
        let saved = record("a", "x", "y", true, 0, 100);
        let busy = record("b", "x", "y", false, 50, 0);
        assert_eq!(keep_preference(&saved, &busy), Ordering::Greater);

        let newer = record("c", "x", "y", false, 3, 0);
        let older = record("d", "x", "y", false, 3, 5);
        assert_eq!(keep_preference(&newer, &older), Ordering::Greater);
    }
}
