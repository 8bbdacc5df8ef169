//! SQLite-backed cache for chord sheets and search results.
//!
//! Documents are stored under a canonical `artist/title` key in two tables
//! (metadata and body) and are either *saved* (kept until deleted) or
//! *cached* (kept under a TTL and eligible for eviction). Search result sets
//! are keyed by their normalized query and always expire.
//!
//! - Lazy, single-flight connection open with versioned migrations
//! - Per-collection transactions via [`CacheDb::read_once`] / [`CacheDb::write_once`]
//! - Lazy expiration on read, background access tracking
//! - Priority-based eviction when usage crosses the configured threshold

mod access;
pub mod connection;
pub mod consolidate;
pub mod documents;
pub mod eviction;
pub mod executor;
pub mod key;
pub mod maintenance;
pub mod migrations;
pub mod records;
pub mod retention;
pub mod schema;
pub mod search;
pub mod usage;

pub use crate::Error;

pub use connection::{CacheDb, CacheDbBuilder, Location};
pub use consolidate::ConsolidationReport;
pub use eviction::{CleanupMode, CleanupReport, Priority};
pub use executor::Collection;
pub use key::{INVALID_KEY, document_key, search_key};
pub use maintenance::{CacheStats, PurgeReport};
pub use migrations::MigrationReport;
pub use records::{
    ChordSheet, Document, DocumentContent, DocumentMetadata, SearchCacheEntry, SearchStorageInfo, StorageInfo,
    StoredRecord,
};
pub use retention::RetentionState;
pub use schema::Store;
pub use search::SearchQuery;
pub use usage::{PageCountUsage, StorageEstimate, UsageProbe};
