//! Priority-based eviction under storage pressure.
//!
//! Only cached (unsaved) documents and search entries are ever candidates.
//! Each candidate gets a priority (higher means keep longer); a cleanup run
//! keeps only the lowest-ranked candidates that fit in its removal budget
//! while paging, then removes them in order until usage is back under the
//! threshold or the budget is spent.
//!
//! Document priority is a recency bucket plus a frequency bonus:
//!
//! | since last access | points | | access count | bonus |
//! |-------------------|--------|-|--------------|-------|
//! | < 1 day           | 50     | | > 10         | +40   |
//! | < 3 days          | 30     | | > 5          | +25   |
//! | < 7 days          | 15     | | > 2          | +15   |
//! | < 30 days         | 5      | | otherwise    | +0    |
//! | older             | 0      | |              |       |
//!
//! Search entries score a small bonus when cached in the last day or week and
//! a large penalty once past their own TTL, so stale results go first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rusqlite::rusqlite::{OptionalExtension, params};

use super::connection::CacheDb;
use super::executor::{count, page};
use super::records::{DocumentMetadata, SearchCacheEntry, StoredRecord};
use super::schema::Store;
use crate::Error;

/// Score of a record that must never be evicted.
pub const PROTECTED_SCORE: i32 = i32::MAX;

/// Score added to search entries that are already past their TTL.
pub const EXPIRED_SEARCH_PENALTY: i32 = -100;

const SCAN_PAGE_SIZE: usize = 256;

/// Eviction priority: higher keeps a record longer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Priority {
    pub score: i32,
    /// Human-readable explanation, e.g. "accessed today, frequently used".
    pub reason: String,
}

impl Priority {
    pub fn protected() -> Self {
        Self { score: PROTECTED_SCORE, reason: "saved by user".to_string() }
    }

    pub fn is_protected(&self) -> bool {
        self.score == PROTECTED_SCORE
    }
}

/// Points for how recently a record was used. Negative ages count as now.
pub fn recency_score(since_access: Duration) -> (i32, &'static str) {
    if since_access < Duration::days(1) {
        (50, "accessed today")
    } else if since_access < Duration::days(3) {
        (30, "accessed in the last 3 days")
    } else if since_access < Duration::days(7) {
        (15, "accessed this week")
    } else if since_access < Duration::days(30) {
        (5, "accessed this month")
    } else {
        (0, "not accessed in 30+ days")
    }
}

/// Bonus for how often a record was read.
pub fn frequency_score(access_count: u32) -> (i32, &'static str) {
    match access_count {
        c if c > 10 => (40, "frequently used"),
        c if c > 5 => (25, "regularly used"),
        c if c > 2 => (15, "occasionally used"),
        _ => (0, "rarely used"),
    }
}

/// Priority of a document. Saved documents are always protected.
pub fn document_priority(metadata: &DocumentMetadata, now: DateTime<Utc>) -> Priority {
    if metadata.storage.saved {
        return Priority::protected();
    }
    let (recency, recency_reason) = recency_score(now - metadata.storage.last_accessed);
    let (frequency, frequency_reason) = frequency_score(metadata.storage.access_count);
    Priority { score: recency + frequency, reason: format!("{recency_reason}, {frequency_reason}") }
}

/// Priority of a cached search result set.
pub fn search_priority(entry: &SearchCacheEntry, now: DateTime<Utc>) -> Priority {
    let age = now - entry.storage.timestamp;
    let (mut score, age_reason) = if age < Duration::days(1) {
        (20, "cached today")
    } else if age < Duration::days(7) {
        (10, "cached this week")
    } else {
        (0, "cached over a week ago")
    };

    if entry.is_expired(now) {
        score += EXPIRED_SEARCH_PENALTY;
        return Priority { score, reason: format!("{age_reason}, expired") };
    }
    Priority { score, reason: age_reason.to_string() }
}

/// A record a cleanup run may remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub store: Store,
    pub key: String,
    pub priority: Priority,
    /// Last read for documents, cache time for search entries.
    pub last_used: DateTime<Utc>,
    pub estimated_bytes: u64,
}

/// Removal order: lowest priority first, then least recently used.
pub fn eviction_order(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    a.priority.score.cmp(&b.priority.score).then(a.last_used.cmp(&b.last_used))
}

/// Heap entry ordered by [`eviction_order`], key as the final tiebreak.
struct Ranked(EvictionCandidate);

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        eviction_order(&self.0, &other.0)
            .then_with(|| self.0.store.table().cmp(other.0.store.table()))
            .then_with(|| self.0.key.cmp(&other.0.key))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// The `limit` candidates that go first, in removal order.
///
/// Holds at most `limit` candidates at a time: the max-heap top is the most
/// valuable one kept so far and is dropped whenever the heap overflows.
struct Shortlist {
    heap: BinaryHeap<Ranked>,
    limit: usize,
    seen: u64,
}

impl Shortlist {
    fn new(limit: usize) -> Self {
        Self { heap: BinaryHeap::with_capacity(limit.saturating_add(1)), limit, seen: 0 }
    }

    fn offer(&mut self, candidate: EvictionCandidate) {
        self.seen += 1;
        if self.limit == 0 {
            return;
        }
        self.heap.push(Ranked(candidate));
        if self.heap.len() > self.limit {
            self.heap.pop();
        }
    }

    fn into_ordered(self) -> Vec<EvictionCandidate> {
        self.heap.into_sorted_vec().into_iter().map(|r| r.0).collect()
    }
}

/// When a cleanup run stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Do nothing unless usage is above the threshold.
    IfNeeded,
    /// Run regardless of usage and keep going until at least `bytes_needed`
    /// have been freed (and usage is under the threshold), or the budget runs out.
    Force { bytes_needed: u64 },
}

/// Summary of one cleanup run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// False when usage was under the threshold and nothing was scanned.
    pub triggered: bool,
    /// True when another run was already in progress.
    pub skipped: bool,
    pub documents_removed: u64,
    pub search_removed: u64,
    /// Serialized-size estimate of what was removed.
    pub bytes_freed: u64,
    /// Saved documents excluded from the scan.
    pub protected: u64,
    /// Deletes that failed and were skipped.
    pub failed: u64,
    pub budget_exhausted: bool,
    pub usage_before: f64,
    /// Estimated from `usage_before` minus `bytes_freed`.
    pub usage_after: f64,
}

/// A lazy, restartable walk over one collection's eviction candidates.
///
/// Pages are fetched by key, so a scan can resume from `resume_after` and
/// never holds more than one page of full records.
pub struct CandidateScan {
    db: CacheDb,
    store: Store,
    now: DateTime<Utc>,
    resume_after: Option<String>,
    done: bool,
}

impl CandidateScan {
    pub fn new(db: &CacheDb, store: Store, now: DateTime<Utc>) -> Self {
        Self { db: db.clone(), store, now, resume_after: None, done: false }
    }

    /// Last key returned, for restarting a scan later.
    pub fn resume_after(&self) -> Option<&str> {
        self.resume_after.as_deref()
    }

    /// Next page of candidates, or `None` when the collection is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<EvictionCandidate>>, Error> {
        if self.done {
            return Ok(None);
        }
        let after = self.resume_after.clone();
        let now = self.now;
        let page = match self.store {
            Store::DocumentMetadata => {
                self.db
                    .read_once(Store::DocumentMetadata, move |tx| {
                        let records = page::<DocumentMetadata>(tx, after.as_deref(), Some("saved = 0"), SCAN_PAGE_SIZE)?;
                        let mut body_len = tx.prepare_cached(
                            "SELECT length(CAST(body AS BLOB)) FROM document_content WHERE key = ?1",
                        )?;
                        let mut out = Vec::with_capacity(records.len());
                        for record in records {
                            let body: Option<i64> = body_len
                                .query_row(params![record.key()], |row| row.get::<_, Option<i64>>(0))
                                .optional()?
                                .flatten();
                            out.push(EvictionCandidate {
                                store: Store::DocumentMetadata,
                                key: record.key().to_string(),
                                priority: document_priority(&record, now),
                                last_used: record.storage.last_accessed,
                                estimated_bytes: (record.estimated_size() as u64) + body.unwrap_or(0).max(0) as u64,
                            });
                        }
                        Ok(out)
                    })
                    .await?
            }
            Store::SearchCache => {
                self.db
                    .read_once(Store::SearchCache, move |tx| {
                        let records = page::<SearchCacheEntry>(tx, after.as_deref(), None, SCAN_PAGE_SIZE)?;
                        Ok(records
                            .into_iter()
                            .map(|entry| EvictionCandidate {
                                store: Store::SearchCache,
                                priority: search_priority(&entry, now),
                                last_used: entry.storage.timestamp,
                                estimated_bytes: entry.estimated_size() as u64,
                                key: entry.key().to_string(),
                            })
                            .collect())
                    })
                    .await?
            }
            Store::DocumentContent => Vec::new(),
        };

        if page.len() < SCAN_PAGE_SIZE {
            self.done = true;
        }
        if let Some(last) = page.last() {
            self.resume_after = Some(last.key.clone());
        }
        if page.is_empty() { Ok(None) } else { Ok(Some(page)) }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::SeqCst);
    }
}

impl CacheDb {
    /// Receive a [`CleanupReport`] after every completed cleanup run.
    pub fn subscribe_cleanup(&self) -> broadcast::Receiver<CleanupReport> {
        self.inner.cleanup_events.subscribe()
    }

    /// Run one cleanup pass.
    ///
    /// Never removes saved documents. A failed delete is logged and the run
    /// moves on to the next candidate; each delete is its own transaction.
    /// Overlapping runs are not allowed: a second caller gets a report with
    /// `skipped` set.
    pub async fn run_cleanup(&self, mode: CleanupMode) -> Result<CleanupReport, Error> {
        if self.inner.cleanup_running.swap(true, AtomicOrdering::SeqCst) {
            tracing::debug!("cleanup already running; skipping");
            return Ok(CleanupReport { skipped: true, ..Default::default() });
        }
        let _running = RunningGuard(&self.inner.cleanup_running);

        let estimate = self.storage_estimate().await;
        let threshold = self.config().cleanup_threshold_ratio;
        let usage_before = estimate.ratio();
        let mut report = CleanupReport { usage_before, usage_after: usage_before, ..Default::default() };

        if mode == CleanupMode::IfNeeded && usage_before <= threshold {
            return Ok(report);
        }
        report.triggered = true;

        let now = Utc::now();
        let budget = self.config().max_removals_per_run;
        let mut shortlist = Shortlist::new(budget);
        for store in [Store::DocumentMetadata, Store::SearchCache] {
            let mut scan = CandidateScan::new(self, store, now);
            while let Some(page) = scan.next_page().await? {
                for candidate in page {
                    shortlist.offer(candidate);
                }
            }
        }
        report.protected =
            self.read_once(Store::DocumentMetadata, |tx| count(tx, Store::DocumentMetadata, Some("saved = 1"))).await?;
        let scanned = shortlist.seen;

        let threshold_bytes = (estimate.target_bytes as f64 * threshold) as u64;
        let bytes_needed = match mode {
            CleanupMode::IfNeeded => 0,
            CleanupMode::Force { bytes_needed } => bytes_needed,
        };
        let satisfied = |used: u64, freed: u64| used <= threshold_bytes && freed >= bytes_needed;
        let mut used = estimate.used_bytes;

        for candidate in shortlist.into_ordered() {
            if satisfied(used, report.bytes_freed) {
                break;
            }

            match self.evict(&candidate).await {
                Ok(true) => {
                    tracing::debug!(
                        store = %candidate.store,
                        key = %candidate.key,
                        score = candidate.priority.score,
                        reason = %candidate.priority.reason,
                        "evicted cache record"
                    );
                    match candidate.store {
                        Store::SearchCache => report.search_removed += 1,
                        _ => report.documents_removed += 1,
                    }
                    report.bytes_freed += candidate.estimated_bytes;
                    used = used.saturating_sub(candidate.estimated_bytes);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(store = %candidate.store, key = %candidate.key, error = %e, "eviction delete failed");
                    report.failed += 1;
                }
            }
        }
        let removed = report.documents_removed + report.search_removed;
        report.budget_exhausted =
            removed >= budget as u64 && scanned > removed && !satisfied(used, report.bytes_freed);

        if estimate.target_bytes > 0 {
            report.usage_after = used as f64 / estimate.target_bytes as f64;
        }
        tracing::info!(
            documents_removed = report.documents_removed,
            search_removed = report.search_removed,
            bytes_freed = report.bytes_freed,
            protected = report.protected,
            failed = report.failed,
            usage_before = report.usage_before,
            usage_after = report.usage_after,
            "cache cleanup finished"
        );

        // no subscribers is fine
        let _ = self.inner.cleanup_events.send(report.clone());
        Ok(report)
    }

    /// Remove one candidate. Returns false if it vanished or became saved
    /// since the scan.
    async fn evict(&self, candidate: &EvictionCandidate) -> Result<bool, Error> {
        let key = candidate.key.clone();
        match candidate.store {
            Store::SearchCache => {
                self.write_once(Store::SearchCache, move |tx| {
                    Ok(tx.execute("DELETE FROM search_cache WHERE key = ?1", params![key])? > 0)
                })
                .await
            }
            _ => {
                self.write_once(Store::DocumentMetadata, move |tx| {
                    let evictable: bool = tx
                        .query_row(
                            "SELECT EXISTS(SELECT 1 FROM document_metadata WHERE key = ?1 AND saved = 0)",
                            params![key],
                            |row| row.get(0),
                        )?;
                    if !evictable {
                        return Ok(false);
                    }
                    tx.execute("DELETE FROM document_content WHERE key = ?1", params![key])?;
                    tx.execute("DELETE FROM document_metadata WHERE key = ?1 AND saved = 0", params![key])?;
                    Ok(true)
                })
                .await
            }
        }
    }

    /// Cleanup if usage is over the threshold.
    pub async fn maybe_cleanup(&self) -> Result<CleanupReport, Error> {
        self.run_cleanup(CleanupMode::IfNeeded).await
    }

    /// Fire-and-forget [`Self::maybe_cleanup`].
    pub fn spawn_cleanup(&self) {
        let db = self.clone();
        self.spawn_background("cleanup", async move { db.maybe_cleanup().await.map(|_| ()) });
    }

    /// Check usage now and then every `cleanup_interval_secs`, cleaning up
    /// when needed. The task ends by itself once every handle is dropped.
    pub fn start_cleanup_timer(&self) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let period = self.config().cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let db = CacheDb { inner };
                if let Err(e) = db.maybe_cleanup().await {
                    tracing::warn!(error = %e, "scheduled cache cleanup failed");
                }
            }
        })
    }

    /// Advisory pre-write check: schedule a background cleanup if this
    /// write would push usage over the threshold. Never blocks on the run.
    pub(crate) async fn admit_write(&self, estimated_bytes: u64) {
        if self.would_exceed_after_write(estimated_bytes).await {
            tracing::debug!(estimated_bytes, "write would exceed cleanup threshold; scheduling cleanup");
            self.spawn_cleanup();
        }
    }

    /// Run `op`; if it fails on quota, run a forced cleanup and try once more.
    pub(crate) async fn with_quota_retry<T, F, Fut>(&self, bytes_needed: u64, op: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        match op().await {
            Err(e) if e.is_quota_exceeded() => {
                tracing::warn!(bytes_needed, "write hit storage quota; evicting and retrying once");
                if let Err(cleanup_err) = self.run_cleanup(CleanupMode::Force { bytes_needed }).await {
                    tracing::warn!(error = %cleanup_err, "cleanup after quota failure failed");
                }
                op().await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::records::{DocumentContent, SearchStorageInfo, StorageInfo};
    use crate::cache::usage::testing::FixedUsage;
    use crate::config::AppConfig;
    use std::collections::{BTreeMap, BTreeSet};

    const TARGET: u64 = 100_000;

    fn config() -> AppConfig {
        AppConfig { storage_target_bytes: TARGET, ..Default::default() }
    }

    fn unsaved(key: &str, since_access: Duration, access_count: u32) -> DocumentMetadata {
        let now = Utc::now();
        let mut storage = StorageInfo::new_cached(now - Duration::days(60), Duration::days(365));
        storage.last_accessed = now - since_access;
        storage.access_count = access_count;
        DocumentMetadata {
            key: key.to_string(),
            title: key.to_string(),
            artist: "various".into(),
            song_key: None,
            tuning: None,
            capo: None,
            storage,
        }
    }

    fn saved(key: &str, since_access: Duration) -> DocumentMetadata {
        let mut meta = unsaved(key, since_access, 0);
        meta.storage.mark_saved(Utc::now() - since_access);
        meta.storage.last_accessed = Utc::now() - since_access;
        meta
    }

    async fn put_document(db: &CacheDb, meta: DocumentMetadata) {
        let key = meta.key.clone();
        db.collection::<DocumentMetadata>().put(meta).await.unwrap();
        db.collection::<DocumentContent>().put(DocumentContent { key, body: "x".repeat(500) }).await.unwrap();
    }

    #[test]
    fn test_recency_buckets() {
        assert_eq!(recency_score(Duration::hours(2)).0, 50);
        assert_eq!(recency_score(Duration::hours(-2)).0, 50);
        assert_eq!(recency_score(Duration::days(2)).0, 30);
        assert_eq!(recency_score(Duration::days(5)).0, 15);
        assert_eq!(recency_score(Duration::days(29)).0, 5);
        assert_eq!(recency_score(Duration::days(30)).0, 0);
    }

    #[test]
    fn test_frequency_buckets() {
        assert_eq!(frequency_score(11).0, 40);
        assert_eq!(frequency_score(10).0, 25);
        assert_eq!(frequency_score(6).0, 25);
        assert_eq!(frequency_score(3).0, 15);
        assert_eq!(frequency_score(2).0, 0);
    }

    #[test]
    fn test_document_priority_reason() {
        let now = Utc::now();
        let p = document_priority(&unsaved("a", Duration::hours(2), 15), now);
        assert_eq!(p.score, 90);
        assert_eq!(p.reason, "accessed today, frequently used");

        let p = document_priority(&unsaved("b", Duration::days(40), 1), now);
        assert_eq!(p.score, 0);
    }

    #[test]
    fn test_saved_documents_are_protected() {
        let p = document_priority(&saved("a", Duration::days(400)), Utc::now());
        assert!(p.is_protected());
    }

    #[test]
    fn test_more_recent_access_never_scores_lower() {
        let now = Utc::now();
        let ages = [0, 1, 12, 25, 49, 71, 72, 100, 167, 168, 300, 719, 720, 2000];
        for count in [0, 3, 6, 11, 50] {
            for pair in ages.windows(2) {
                let recent = document_priority(&unsaved("r", Duration::hours(pair[0]), count), now);
                let older = document_priority(&unsaved("o", Duration::hours(pair[1]), count), now);
                assert!(recent.score >= older.score, "{pair:?} with count {count}");
            }
        }
    }

    #[test]
    fn test_search_priority_penalizes_expired() {
        let now = Utc::now();
        let entry = |age: Duration, ttl: Duration| SearchCacheEntry {
            key: "search/all".into(),
            query: BTreeMap::new(),
            result_type: "songs".into(),
            data_source: "supabase".into(),
            results: vec![],
            storage: SearchStorageInfo::new(now - age, ttl),
        };
        assert_eq!(search_priority(&entry(Duration::hours(1), Duration::days(30)), now).score, 20);
        assert_eq!(search_priority(&entry(Duration::days(3), Duration::days(30)), now).score, 10);
        assert_eq!(search_priority(&entry(Duration::days(10), Duration::days(30)), now).score, 0);
        let expired = search_priority(&entry(Duration::days(40), Duration::days(30)), now);
        assert_eq!(expired.score, EXPIRED_SEARCH_PENALTY);
        assert!(expired.reason.ends_with("expired"));
    }

    #[test]
    fn test_eviction_order_breaks_ties_by_age() {
        let now = Utc::now();
        let candidate = |key: &str, score: i32, hours: i64| EvictionCandidate {
            store: Store::DocumentMetadata,
            key: key.to_string(),
            priority: Priority { score, reason: String::new() },
            last_used: now - Duration::hours(hours),
            estimated_bytes: 1,
        };
        let mut list = vec![candidate("new", 5, 1), candidate("old", 5, 10), candidate("low", 0, 0)];
        list.sort_by(eviction_order);
        let keys: Vec<&str> = list.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, ["low", "old", "new"]);
    }

    #[tokio::test]
    async fn test_cleanup_not_triggered_under_threshold() {
        let usage = FixedUsage::new(TARGET / 2);
        let db = CacheDb::builder(config()).in_memory().usage_probe(usage).open().await.unwrap();
        put_document(&db, unsaved("stale", Duration::days(90), 0)).await;

        let report = db.maybe_cleanup().await.unwrap();
        assert!(!report.triggered);
        assert_eq!(report.documents_removed, 0);
        assert!(db.collection::<DocumentMetadata>().get("stale").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_removes_lowest_priority_first() {
        // just over the threshold: one small removal is enough
        let usage = FixedUsage::new(TARGET * 8 / 10 + 1);
        let db = CacheDb::builder(config()).in_memory().usage_probe(usage).open().await.unwrap();
        put_document(&db, unsaved("a", Duration::hours(2), 15)).await;
        put_document(&db, unsaved("b", Duration::days(40), 1)).await;

        let report = db.maybe_cleanup().await.unwrap();
        assert!(report.triggered);
        assert_eq!(report.documents_removed, 1);
        assert!(report.bytes_freed > 500);
        assert!(report.usage_after < 0.8);

        let docs = db.collection::<DocumentMetadata>();
        assert!(docs.get("a").await.unwrap().is_some());
        assert!(docs.get("b").await.unwrap().is_none());
        assert!(db.collection::<DocumentContent>().get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_never_removes_saved() {
        let usage = FixedUsage::new(TARGET * 10);
        let db = CacheDb::builder(config()).in_memory().usage_probe(usage).open().await.unwrap();
        for i in 0..5 {
            put_document(&db, saved(&format!("saved-{i}"), Duration::days(400))).await;
        }
        for i in 0..3 {
            put_document(&db, unsaved(&format!("cached-{i}"), Duration::hours(1), 100)).await;
        }

        let report = db.maybe_cleanup().await.unwrap();
        assert_eq!(report.protected, 5);
        assert_eq!(report.documents_removed, 3);

        let remaining = db.collection::<DocumentMetadata>().get_all().await.unwrap();
        assert_eq!(remaining.len(), 5);
        assert!(remaining.iter().all(|m| m.storage.saved));
    }

    #[tokio::test]
    async fn test_cleanup_respects_removal_budget() {
        let usage = FixedUsage::new(TARGET * 10);
        let config = AppConfig { max_removals_per_run: 2, ..config() };
        let db = CacheDb::builder(config).in_memory().usage_probe(usage).open().await.unwrap();
        for i in 0..5 {
            put_document(&db, unsaved(&format!("cached-{i}"), Duration::days(i), 0)).await;
        }

        let report = db.maybe_cleanup().await.unwrap();
        assert_eq!(report.documents_removed, 2);
        assert!(report.budget_exhausted);

        let docs = db.collection::<DocumentMetadata>();
        assert!(docs.get("cached-4").await.unwrap().is_none());
        assert!(docs.get("cached-3").await.unwrap().is_none());
        assert!(docs.get("cached-0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_search_entries_go_first() {
        let usage = FixedUsage::new(TARGET * 8 / 10 + 1);
        let db = CacheDb::builder(config()).in_memory().usage_probe(usage).open().await.unwrap();
        put_document(&db, unsaved("old-doc", Duration::days(40), 0)).await;

        let now = Utc::now();
        let expired = SearchCacheEntry {
            key: "search/artist=hillsong".into(),
            query: BTreeMap::from([("artist".to_string(), "hillsong".to_string())]),
            result_type: "songs".into(),
            data_source: "supabase".into(),
            results: vec![serde_json::json!({"title": "Oceans"})],
            storage: SearchStorageInfo::new(now - Duration::days(40), Duration::days(30)),
        };
        db.collection::<SearchCacheEntry>().put(expired).await.unwrap();

        let report = db.maybe_cleanup().await.unwrap();
        assert_eq!(report.search_removed, 1);
        assert_eq!(report.documents_removed, 0);
        assert!(db.collection::<DocumentMetadata>().get("old-doc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_publishes_report() {
        let usage = FixedUsage::new(TARGET * 10);
        let db = CacheDb::builder(config()).in_memory().usage_probe(usage).open().await.unwrap();
        let mut events = db.subscribe_cleanup();
        put_document(&db, unsaved("a", Duration::days(40), 0)).await;

        let report = db.maybe_cleanup().await.unwrap();
        let published = events.recv().await.unwrap();
        assert_eq!(published, report);
    }

    #[tokio::test]
    async fn test_candidate_scan_pages_and_skips_saved() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let total = SCAN_PAGE_SIZE * 2 + 20;
        let mut expected = BTreeSet::new();
        for i in 0..total {
            let key = format!("doc-{i:04}");
            let meta = if i % 5 == 0 {
                saved(&key, Duration::days(1))
            } else {
                expected.insert(key.clone());
                unsaved(&key, Duration::days(1), 0)
            };
            db.collection::<DocumentMetadata>().put(meta).await.unwrap();
        }
        assert!(expected.len() > SCAN_PAGE_SIZE);

        let mut scan = CandidateScan::new(&db, Store::DocumentMetadata, Utc::now());
        let mut seen = BTreeSet::new();
        let mut pages = 0;
        while let Some(page) = scan.next_page().await.unwrap() {
            assert!(page.len() <= SCAN_PAGE_SIZE);
            for candidate in page {
                assert!(!candidate.priority.is_protected());
                assert!(seen.insert(candidate.key.clone()), "duplicate {}", candidate.key);
            }
            pages += 1;
        }
        assert!(pages >= 2);
        assert_eq!(seen, expected);
        assert_eq!(scan.resume_after(), expected.last().map(String::as_str));
        assert!(scan.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_candidate_scan_resumes_from_key() {
        let db = CacheDb::open_in_memory().await.unwrap();
        for i in 0..(SCAN_PAGE_SIZE + 10) {
            db.collection::<DocumentMetadata>()
                .put(unsaved(&format!("doc-{i:04}"), Duration::days(1), 0))
                .await
                .unwrap();
        }

        let mut first = CandidateScan::new(&db, Store::DocumentMetadata, Utc::now());
        let head = first.next_page().await.unwrap().unwrap();
        assert_eq!(head.len(), SCAN_PAGE_SIZE);
        let resume = first.resume_after().map(str::to_string);
        assert_eq!(resume.as_deref(), Some(format!("doc-{:04}", SCAN_PAGE_SIZE - 1).as_str()));

        let tail = first.next_page().await.unwrap().unwrap();
        assert_eq!(tail.len(), 10);
        assert_eq!(tail[0].key, format!("doc-{SCAN_PAGE_SIZE:04}"));
        assert!(first.next_page().await.unwrap().is_none());
    }

    #[test]
    fn test_shortlist_keeps_lowest_ranked() {
        let now = Utc::now();
        let mut shortlist = Shortlist::new(3);
        for i in 0..1000i64 {
            shortlist.offer(EvictionCandidate {
                store: Store::DocumentMetadata,
                key: format!("k{i}"),
                priority: Priority { score: (i % 7) as i32, reason: String::new() },
                last_used: now - Duration::minutes(i),
                estimated_bytes: 1,
            });
            assert!(shortlist.heap.len() <= 3);
        }
        assert_eq!(shortlist.seen, 1000);

        let keys: Vec<String> = shortlist.into_ordered().into_iter().map(|c| c.key).collect();
        // score 0 with the oldest last use first
        assert_eq!(keys, ["k994", "k987", "k980"]);
    }

    #[tokio::test]
    async fn test_budgeted_cleanup_picks_lowest_across_pages() {
        let usage = FixedUsage::new(TARGET * 10);
        let config = AppConfig { max_removals_per_run: 5, ..config() };
        let db = CacheDb::builder(config).in_memory().usage_probe(usage).open().await.unwrap();
        let total = SCAN_PAGE_SIZE + 44;
        for i in 0..total {
            let key = format!("doc-{i:04}");
            // the ten stalest sit on the last scan page
            let meta = if i >= total - 10 {
                unsaved(&key, Duration::days(40 + (i - (total - 10)) as i64), 0)
            } else {
                unsaved(&key, Duration::hours(1), 0)
            };
            put_document(&db, meta).await;
        }

        let report = db.maybe_cleanup().await.unwrap();
        assert_eq!(report.documents_removed, 5);
        assert!(report.budget_exhausted);

        let remaining: BTreeSet<String> =
            db.collection::<DocumentMetadata>().get_all().await.unwrap().into_iter().map(|m| m.key).collect();
        assert_eq!(remaining.len(), total - 5);
        for i in (total - 5)..total {
            assert!(!remaining.contains(&format!("doc-{i:04}")));
        }
        for i in (total - 10)..(total - 5) {
            assert!(remaining.contains(&format!("doc-{i:04}")));
        }
    }

    #[tokio::test]
    async fn test_failed_delete_is_skipped_and_rolled_back() {
        let usage = FixedUsage::new(TARGET * 10);
        let db = CacheDb::builder(config()).in_memory().usage_probe(usage).open().await.unwrap();
        for key in ["a/old", "b/old", "c/old"] {
            put_document(&db, unsaved(key, Duration::days(40), 0)).await;
        }
        db.write_once(Store::DocumentMetadata, |tx| {
            tx.execute_batch(
                "CREATE TRIGGER block_b_old BEFORE DELETE ON document_metadata
                 WHEN old.key = 'b/old'
                 BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let report = db.maybe_cleanup().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.documents_removed, 2);

        let left: Vec<String> =
            db.collection::<DocumentMetadata>().get_all().await.unwrap().into_iter().map(|m| m.key).collect();
        assert_eq!(left, ["b/old"]);
        let content = db.collection::<DocumentContent>().get_all().await.unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].key, "b/old");
        assert_eq!(content[0].body.len(), 500);
    }

    #[tokio::test]
    async fn test_quota_failure_evicts_and_retries() {
        let config = AppConfig { quota_bytes: Some(256 * 1024), ..Default::default() };
        let db = CacheDb::builder(config).in_memory().open().await.unwrap();

        let keeper = crate::cache::records::ChordSheet {
            artist: "Keeper".into(),
            title: "Saved Song".into(),
            body: "k".repeat(8_000),
            ..Default::default()
        };
        db.save_document(keeper).await.unwrap();

        for i in 0..60 {
            let sheet = crate::cache::records::ChordSheet {
                artist: "Filler".into(),
                title: format!("Song {i}"),
                body: "f".repeat(8_000),
                ..Default::default()
            };
            db.cache_document(sheet).await.unwrap();
        }
        db.settle().await;

        let remaining = db.list_documents().await.unwrap();
        assert!(remaining.len() < 61);
        assert!(remaining.iter().any(|m| m.key == "keeper/saved-song"));
        assert!(remaining.iter().any(|m| m.key == "filler/song-59"));
    }

    #[tokio::test]
    async fn test_timer_runs_cleanup_and_exits_when_handle_dropped() {
        let usage = FixedUsage::new(TARGET * 10);
        let config = AppConfig { cleanup_interval_secs: 1, ..config() };
        let db = CacheDb::builder(config).in_memory().usage_probe(usage).open().await.unwrap();
        put_document(&db, unsaved("stale", Duration::days(40), 0)).await;
        let mut events = db.subscribe_cleanup();

        let timer = db.start_cleanup_timer();
        let report = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("timer never ran a cleanup")
            .unwrap();
        assert!(report.triggered);
        assert_eq!(report.documents_removed, 1);
        assert!(db.collection::<DocumentMetadata>().get("stale").await.unwrap().is_none());

        drop(db);
        let finished = tokio::time::timeout(std::time::Duration::from_secs(5), timer).await;
        assert!(matches!(finished, Ok(Ok(()))), "timer kept running: {finished:?}");
    }
}
