//! Database schema migrations.
//!
//! Uses a version table to track applied schema steps. Each step is an
//! ordered [`MigrationStep`]: its SQL runs inside one transaction together
//! with the version bump, so a failed step leaves the previous version in
//! place. Steps that also move data carry a [`DataTransform`], which runs
//! after the schema commits, in batches, and records completion in
//! `_migration_flags`.
//!
//! Data transforms are at-least-once, not exactly-once: a crash between a
//! schema commit and the end of its transform leaves the schema bumped and the
//! data partly moved. Every transform is therefore written to be safely
//! re-run from any intermediate state, and the next open picks it up again.

use serde::{Deserialize, Serialize};
use tokio_rusqlite::{Connection, params, rusqlite};

use super::consolidate::consolidate;
use super::executor::insert_if_absent;
use super::records::{DocumentContent, DocumentMetadata, StorageInfo, from_millis};
use super::schema::{LEGACY_DOCUMENT_TTL_DAYS, RECORD_VERSION};
use crate::Error;

/// Post-upgrade data move attached to a schema step.
pub struct DataTransform {
    /// Completion flag name.
    pub name: &'static str,
    /// Returns how many records it migrated.
    pub apply: fn(&mut rusqlite::Connection) -> Result<usize, Error>,
}

/// One schema version increment.
pub struct MigrationStep {
    pub version: i64,
    pub description: &'static str,
    pub schema: &'static str,
    pub transform: Option<DataTransform>,
}

/// Ordered migration steps. All schema SQL is idempotent (IF NOT EXISTS).
pub const STEPS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        description: "single-table documents",
        schema: include_str!("../../migrations/001_documents.sql"),
        transform: None,
    },
    MigrationStep {
        version: 2,
        description: "split document metadata and content",
        schema: include_str!("../../migrations/002_split_content.sql"),
        transform: Some(DataTransform { name: "split_documents_v1", apply: split_legacy_documents }),
    },
    MigrationStep {
        version: 3,
        description: "search result cache",
        schema: include_str!("../../migrations/003_search_cache.sql"),
        transform: None,
    },
    MigrationStep {
        version: 4,
        description: "eviction indexes",
        schema: include_str!("../../migrations/004_eviction_indexes.sql"),
        transform: None,
    },
    MigrationStep {
        version: 5,
        description: "canonical document keys",
        schema: include_str!("../../migrations/005_canonical_keys.sql"),
        transform: Some(DataTransform { name: "canonical_keys", apply: consolidate_keys }),
    },
];

/// Schema version a fully migrated database is at.
pub const SCHEMA_VERSION: i64 = 5;

const LEGACY_BATCH_SIZE: i64 = 500;

/// Outcome of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    /// Records moved or rewritten by data transforms during this run.
    pub migrated_count: usize,
    /// Transform failures. The run continues past them.
    pub errors: Vec<String>,
}

/// Run any pending migrations.
///
/// This creates the bookkeeping tables if they don't exist, applies schema
/// steps above the current version, then runs every data transform that has
/// not completed yet.
///
/// # Errors
///
/// Returns [`Error::Connection`] if a schema step fails; this is fatal.
/// Transform failures are logged and reported in [`MigrationReport::errors`].
pub async fn run(conn: &Connection) -> Result<MigrationReport, Error> {
    run_to(conn, SCHEMA_VERSION).await
}

pub(crate) async fn run_to(conn: &Connection, target: i64) -> Result<MigrationReport, Error> {
    conn.call(move |conn| -> Result<MigrationReport, Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS _migration_flags (
                name TEXT PRIMARY KEY,
                completed_at TEXT NOT NULL
            );",
        )
        .map_err(|e| Error::Connection(e.to_string()))?;

        let from_version = current_version(conn)?;

        for step in STEPS.iter().filter(|s| s.version > from_version && s.version <= target) {
            apply_schema(conn, step).map_err(|e| {
                Error::Connection(format!("schema upgrade to v{} ({}) failed: {e}", step.version, step.description))
            })?;
            tracing::info!(version = step.version, description = step.description, "applied schema migration");
        }

        let to_version = current_version(conn)?;
        let mut report = MigrationReport { from_version, to_version, ..Default::default() };

        for step in STEPS.iter().filter(|s| s.version <= to_version) {
            let Some(transform) = &step.transform else {
                continue;
            };
            if transform_completed(conn, transform.name)? {
                continue;
            }

            match (transform.apply)(conn) {
                Ok(count) => {
                    mark_completed(conn, transform.name)?;
                    report.migrated_count += count;
                    tracing::info!(transform = transform.name, migrated = count, "data transform completed");
                }
                Err(e) => {
                    tracing::warn!(transform = transform.name, error = %e, "data transform failed; will retry on next open");
                    report.errors.push(Error::MigrationFailed(format!("{}: {e}", transform.name)).to_string());
                }
            }
        }

        Ok(report)
    })
    .await
    .map_err(Error::from)
}

fn current_version(conn: &rusqlite::Connection) -> Result<i64, Error> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))
        .map_err(Error::from)
}

fn apply_schema(conn: &mut rusqlite::Connection, step: &MigrationStep) -> Result<(), Error> {
    let tx = conn.transaction()?;
    tx.execute_batch(step.schema)?;
    tx.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        params![step.version, step.description, chrono::Utc::now().to_rfc3339()],
    )?;
    tx.commit()?;
    Ok(())
}

fn transform_completed(conn: &rusqlite::Connection, name: &str) -> Result<bool, Error> {
    conn.query_row("SELECT EXISTS(SELECT 1 FROM _migration_flags WHERE name = ?1)", params![name], |row| row.get(0))
        .map_err(Error::from)
}

fn mark_completed(conn: &rusqlite::Connection, name: &str) -> Result<(), Error> {
    conn.execute(
        "INSERT OR REPLACE INTO _migration_flags (name, completed_at) VALUES (?1, ?2)",
        params![name, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn table_exists(conn: &rusqlite::Connection, table: &str) -> Result<bool, Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
        params![table],
        |row| row.get(0),
    )
    .map_err(Error::from)
}

/// A row of the single-table layout.
struct LegacyDocument {
    key: String,
    title: String,
    artist: String,
    song_key: Option<String>,
    tuning: Option<String>,
    capo: Option<u8>,
    body: Option<String>,
    saved: bool,
    timestamp: i64,
    last_accessed: i64,
    access_count: u32,
    expires_at: Option<i64>,
}

impl LegacyDocument {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            title: row.get(1)?,
            artist: row.get(2)?,
            song_key: row.get(3)?,
            tuning: row.get(4)?,
            capo: row.get(5)?,
            body: row.get(6)?,
            saved: row.get(7)?,
            timestamp: row.get(8)?,
            last_accessed: row.get(9)?,
            access_count: row.get(10)?,
            expires_at: row.get(11)?,
        })
    }

    /// Split into the two-collection shape, repairing the retention
    /// invariant on the way.
    fn split(self) -> rusqlite::Result<(DocumentMetadata, Option<DocumentContent>)> {
        let timestamp = from_millis(8, self.timestamp)?;
        let expires_at = match (self.saved, self.expires_at) {
            (true, _) => None,
            (false, Some(ms)) => Some(from_millis(11, ms)?),
            (false, None) => Some(timestamp + chrono::Duration::days(LEGACY_DOCUMENT_TTL_DAYS)),
        };
        let metadata = DocumentMetadata {
            key: self.key.clone(),
            title: self.title,
            artist: self.artist,
            song_key: self.song_key,
            tuning: self.tuning,
            capo: self.capo,
            storage: StorageInfo {
                saved: self.saved,
                timestamp,
                last_accessed: from_millis(9, self.last_accessed.max(self.timestamp))?,
                access_count: self.access_count,
                version: RECORD_VERSION,
                expires_at,
                content_available: self.body.is_some(),
            },
        };
        let content = self.body.map(|body| DocumentContent { key: self.key, body });
        Ok((metadata, content))
    }
}

/// Move `documents_v1` rows into the metadata and content collections.
///
/// Each batch commits on its own and deletes the rows it moved, so a re-run
/// only sees what is left. Rows whose key already exists in the new layout
/// are dropped without overwriting the newer record. The legacy table is
/// removed once empty.
fn split_legacy_documents(conn: &mut rusqlite::Connection) -> Result<usize, Error> {
    if !table_exists(conn, "documents_v1")? {
        return Ok(0);
    }

    let mut moved = 0;
    loop {
        let tx = conn.transaction()?;
        let batch = {
            let mut stmt = tx.prepare(
                "SELECT key, title, artist, song_key, tuning, capo, body, saved,
                        timestamp, last_accessed, access_count, expires_at
                 FROM documents_v1 ORDER BY key LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![LEGACY_BATCH_SIZE], LegacyDocument::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        if batch.is_empty() {
            tx.commit()?;
            break;
        }

        let batch_len = batch.len();
        for legacy in batch {
            let key = legacy.key.clone();
            let (metadata, content) = legacy.split()?;
            if insert_if_absent(&tx, &metadata)?
                && let Some(content) = content
            {
                insert_if_absent(&tx, &content)?;
            }
            tx.execute("DELETE FROM documents_v1 WHERE key = ?1", params![key])?;
        }
        tx.commit()?;
        moved += batch_len;
    }

    conn.execute_batch("DROP TABLE IF EXISTS documents_v1;")?;
    Ok(moved)
}

fn consolidate_keys(conn: &mut rusqlite::Connection) -> Result<usize, Error> {
    let tx = conn.transaction()?;
    let report = consolidate(&tx)?;
    tx.commit()?;
    Ok(report.removed + report.rekeyed)
}
