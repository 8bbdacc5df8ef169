//! Saved/cached retention policy.
//!
//! A document is either *cached* (kept under a TTL, eligible for lazy
//! expiration and eviction) or *saved* (kept until explicitly deleted). The
//! transitions here are the only way [`StorageInfo`] changes retention state,
//! which keeps `saved == expires_at.is_none()` true for every record.

use chrono::{DateTime, Duration, Utc};

use super::records::StorageInfo;
use super::schema::RECORD_VERSION;

/// Retention state derived from a storage block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionState {
    Cached { expires_at: DateTime<Utc> },
    Saved,
}

/// Expiry for a record in the given state.
pub fn expires_at(saved: bool, now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    (!saved).then(|| now + ttl)
}

impl StorageInfo {
    /// Storage block for a document first written through the cache path.
    pub fn new_cached(now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            saved: false,
            timestamp: now,
            last_accessed: now,
            access_count: 0,
            version: RECORD_VERSION,
            expires_at: expires_at(false, now, ttl),
            content_available: false,
        }
    }

    /// Storage block for a document first written through the save path.
    pub fn new_saved(now: DateTime<Utc>) -> Self {
        Self {
            saved: true,
            timestamp: now,
            last_accessed: now,
            access_count: 0,
            version: RECORD_VERSION,
            expires_at: None,
            content_available: false,
        }
    }

    pub fn state(&self) -> RetentionState {
        match (self.saved, self.expires_at) {
            (false, Some(expires_at)) => RetentionState::Cached { expires_at },
            _ => RetentionState::Saved,
        }
    }

    /// Cached -> Saved (or Saved -> Saved). Bumps access time but not the count.
    pub fn mark_saved(&mut self, now: DateTime<Utc>) {
        self.saved = true;
        self.expires_at = None;
        self.last_accessed = self.last_accessed.max(now);
        self.version = RECORD_VERSION;
    }

    /// Saved -> Cached with the TTL counted from `now`, not from `timestamp`.
    pub fn mark_cached(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.saved = false;
        self.expires_at = expires_at(false, now, ttl);
        self.version = RECORD_VERSION;
    }

    /// Rewrite by the cache path: a cached record gets a fresh TTL, a saved
    /// record stays saved.
    pub fn refresh(&mut self, now: DateTime<Utc>, ttl: Duration) {
        if !self.saved {
            self.expires_at = expires_at(false, now, ttl);
        }
        self.version = RECORD_VERSION;
    }

    /// Whether a cached record is past its TTL. Saved records never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.state() {
            RetentionState::Cached { expires_at } => now > expires_at,
            RetentionState::Saved => false,
        }
    }

    /// Access bookkeeping applied on a successful read.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed = self.last_accessed.max(now);
        self.access_count = self.access_count.saturating_add(1);
    }
}
