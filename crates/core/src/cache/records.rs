//! Typed records for each collection.
//!
//! Document metadata and document bodies live in separate tables so that
//! lists can be rendered without loading bodies. Every record type knows how
//! to bind itself to, and decode itself from, its own table via
//! [`StoredRecord`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::rusqlite::{self, Row, types::Value};

use super::schema::{RECORD_VERSION, Store};
use crate::Error;

/// A record type persisted in exactly one collection.
pub trait StoredRecord: Serialize + Sized + Send + 'static {
    /// Collection this record belongs to.
    const STORE: Store;

    /// Column names in bind order. The first column is the primary key.
    const COLUMNS: &'static [&'static str];

    /// Primary key.
    fn key(&self) -> &str;

    /// Decode a row selected with [`Self::COLUMNS`] in order.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Values to bind, in [`Self::COLUMNS`] order.
    fn to_values(&self) -> Result<Vec<Value>, Error>;

    /// Serialized-size estimate used when accounting freed bytes.
    fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(column: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}

fn json_column<T: for<'de> Deserialize<'de>>(row: &Row<'_>, column: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e)))
}

/// Retention and access bookkeeping carried by every document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    /// True when the user explicitly kept this document.
    pub saved: bool,
    /// When the document was first stored.
    pub timestamp: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Successful reads; never decreases.
    pub access_count: u32,
    /// Record schema generation.
    pub version: u32,
    /// `None` exactly when `saved` is true.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether a body row exists in the content collection.
    pub content_available: bool,
}

/// List-level view of a chord sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// Canonical `artist/title` key.
    pub key: String,
    pub title: String,
    pub artist: String,
    /// Musical key, e.g. "G" or "F#m".
    pub song_key: Option<String>,
    /// Instrument tuning, e.g. "E A D G B E".
    pub tuning: Option<String>,
    /// Capo fret, 0 when unused.
    pub capo: Option<u8>,
    pub storage: StorageInfo,
}

impl StoredRecord for DocumentMetadata {
    const STORE: Store = Store::DocumentMetadata;
    const COLUMNS: &'static [&'static str] = &[
        "key",
        "title",
        "artist",
        "song_key",
        "tuning",
        "capo",
        "saved",
        "timestamp",
        "last_accessed",
        "access_count",
        "version",
        "expires_at",
        "content_available",
    ];

    fn key(&self) -> &str {
        &self.key
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            title: row.get(1)?,
            artist: row.get(2)?,
            song_key: row.get(3)?,
            tuning: row.get(4)?,
            capo: row.get(5)?,
            storage: StorageInfo {
                saved: row.get(6)?,
                timestamp: from_millis(7, row.get(7)?)?,
                last_accessed: from_millis(8, row.get(8)?)?,
                access_count: row.get(9)?,
                version: row.get(10)?,
                expires_at: row.get::<_, Option<i64>>(11)?.map(|ms| from_millis(11, ms)).transpose()?,
                content_available: row.get(12)?,
            },
        })
    }

    fn to_values(&self) -> Result<Vec<Value>, Error> {
        let s = &self.storage;
        Ok(vec![
            Value::Text(self.key.clone()),
            Value::Text(self.title.clone()),
            Value::Text(self.artist.clone()),
            self.song_key.clone().map_or(Value::Null, Value::Text),
            self.tuning.clone().map_or(Value::Null, Value::Text),
            self.capo.map_or(Value::Null, |c| Value::Integer(i64::from(c))),
            Value::Integer(i64::from(s.saved)),
            Value::Integer(to_millis(s.timestamp)),
            Value::Integer(to_millis(s.last_accessed)),
            Value::Integer(i64::from(s.access_count)),
            Value::Integer(i64::from(s.version)),
            s.expires_at.map_or(Value::Null, |at| Value::Integer(to_millis(at))),
            Value::Integer(i64::from(s.content_available)),
        ])
    }
}

/// Heavy payload of a chord sheet, keyed like its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DocumentContent {
    pub key: String,
    pub body: String,
}

impl StoredRecord for DocumentContent {
    const STORE: Store = Store::DocumentContent;
    const COLUMNS: &'static [&'static str] = &["key", "body"];

    fn key(&self) -> &str {
        &self.key
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self { key: row.get(0)?, body: row.get(1)? })
    }

    fn to_values(&self) -> Result<Vec<Value>, Error> {
        Ok(vec![Value::Text(self.key.clone()), Value::Text(self.body.clone())])
    }

    fn estimated_size(&self) -> usize {
        self.key.len() + self.body.len()
    }
}

/// Metadata joined with its body, when one is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Document {
    pub metadata: DocumentMetadata,
    pub body: Option<String>,
}

/// A freshly fetched chord sheet handed to the cache by the API layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChordSheet {
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub song_key: Option<String>,
    #[serde(default)]
    pub tuning: Option<String>,
    #[serde(default)]
    pub capo: Option<u8>,
    pub body: String,
}

/// Retention bookkeeping for a cached search result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchStorageInfo {
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    /// Search results always expire.
    pub expires_at: DateTime<Utc>,
}

/// A cached search result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchCacheEntry {
    /// Query path key, see [`crate::cache::key::search_key`].
    pub key: String,
    /// Original query parameters.
    pub query: BTreeMap<String, String>,
    /// What kind of items `results` holds, e.g. "songs" or "artists".
    pub result_type: String,
    /// Origin of the results, e.g. "supabase"; selects the TTL.
    pub data_source: String,
    pub results: Vec<serde_json::Value>,
    pub storage: SearchStorageInfo,
}

impl SearchCacheEntry {
    /// Whether this entry is past its TTL at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.storage.expires_at
    }
}

impl StoredRecord for SearchCacheEntry {
    const STORE: Store = Store::SearchCache;
    const COLUMNS: &'static [&'static str] =
        &["key", "query_json", "result_type", "data_source", "results_json", "timestamp", "version", "expires_at"];

    fn key(&self) -> &str {
        &self.key
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            query: json_column(row, 1)?,
            result_type: row.get(2)?,
            data_source: row.get(3)?,
            results: json_column(row, 4)?,
            storage: SearchStorageInfo {
                timestamp: from_millis(5, row.get(5)?)?,
                version: row.get(6)?,
                expires_at: from_millis(7, row.get(7)?)?,
            },
        })
    }

    fn to_values(&self) -> Result<Vec<Value>, Error> {
        Ok(vec![
            Value::Text(self.key.clone()),
            Value::Text(serde_json::to_string(&self.query)?),
            Value::Text(self.result_type.clone()),
            Value::Text(self.data_source.clone()),
            Value::Text(serde_json::to_string(&self.results)?),
            Value::Integer(to_millis(self.storage.timestamp)),
            Value::Integer(i64::from(self.storage.version)),
            Value::Integer(to_millis(self.storage.expires_at)),
        ])
    }
}

impl SearchStorageInfo {
    /// Storage block for results fetched at `now` with the given TTL.
    pub fn new(now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self { timestamp: now, version: RECORD_VERSION, expires_at: now + ttl }
    }
}
