//! Transaction executor and typed collection access.
//!
//! `read_once`/`write_once` run a single closure inside its own SQLite
//! transaction on the connection thread. The free functions below are the
//! per-collection primitives (`get`, `get_all`, `put`, `delete`, `clear`)
//! those closures are built from; they take any `&Connection`, so a
//! `&Transaction` works through deref.

use std::marker::PhantomData;

use tokio_rusqlite::rusqlite::{self, OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter};

use super::connection::CacheDb;
use super::records::StoredRecord;
use super::schema::Store;
use crate::Error;

fn select_sql<R: StoredRecord>() -> String {
    format!("SELECT {} FROM {}", R::COLUMNS.join(", "), R::STORE.table())
}

fn insert_sql<R: StoredRecord>(on_conflict: &str) -> String {
    let placeholders: Vec<String> = (1..=R::COLUMNS.len()).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(key) {on_conflict}",
        R::STORE.table(),
        R::COLUMNS.join(", "),
        placeholders.join(", ")
    )
}

fn is_decode_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..)
    )
}

/// Fetch one record by primary key.
pub fn get<R: StoredRecord>(conn: &rusqlite::Connection, key: &str) -> Result<Option<R>, Error> {
    let sql = format!("{} WHERE key = ?1", select_sql::<R>());
    conn.query_row(&sql, params![key], R::from_row)
        .optional()
        .map_err(|e| if is_decode_error(&e) { Error::CorruptRecord(format!("{}[{key}]: {e}", R::STORE)) } else { e.into() })
}

/// Fetch every record in the collection, ordered by key.
///
/// Rows that no longer decode into `R` are skipped with a warning rather than
/// failing the whole listing.
pub fn get_all<R: StoredRecord>(conn: &rusqlite::Connection) -> Result<Vec<R>, Error> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY key", select_sql::<R>()))?;
    let records = collect_rows(stmt.query_map([], R::from_row)?)?;
    Ok(records)
}

/// Fetch up to `limit` records with keys strictly after `after`, optionally
/// narrowed by a SQL predicate over the collection's columns.
///
/// Keyset pagination keeps scans restartable from the last key seen.
pub fn page<R: StoredRecord>(
    conn: &rusqlite::Connection, after: Option<&str>, predicate: Option<&str>, limit: usize,
) -> Result<Vec<R>, Error> {
    let filter = predicate.map(|p| format!(" AND ({p})")).unwrap_or_default();
    let sql = format!("{} WHERE key > ?1{filter} ORDER BY key LIMIT ?2", select_sql::<R>());
    let mut stmt = conn.prepare(&sql)?;
    let records = collect_rows(stmt.query_map(params![after.unwrap_or(""), limit as i64], R::from_row)?)?;
    Ok(records)
}

fn collect_rows<R: StoredRecord>(
    rows: impl Iterator<Item = rusqlite::Result<R>>,
) -> Result<Vec<R>, Error> {
    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(record) => out.push(record),
            Err(e) if is_decode_error(&e) => {
                tracing::warn!(store = %R::STORE, error = %e, "skipping undecodable record");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}

/// Insert or overwrite a record.
pub fn put<R: StoredRecord>(conn: &rusqlite::Connection, record: &R) -> Result<(), Error> {
    let updates: Vec<String> = R::COLUMNS[1..].iter().map(|c| format!("{c} = excluded.{c}")).collect();
    let sql = insert_sql::<R>(&format!("DO UPDATE SET {}", updates.join(", ")));
    conn.execute(&sql, params_from_iter(record.to_values()?))?;
    tracing::trace!(store = %R::STORE, key = record.key(), "upserted record");
    Ok(())
}

/// Insert a record unless one with the same key exists. Returns whether it was inserted.
pub fn insert_if_absent<R: StoredRecord>(conn: &rusqlite::Connection, record: &R) -> Result<bool, Error> {
    let inserted = conn.execute(&insert_sql::<R>("DO NOTHING"), params_from_iter(record.to_values()?))?;
    Ok(inserted > 0)
}

/// Delete one record. Returns whether it existed.
pub fn delete(conn: &rusqlite::Connection, store: Store, key: &str) -> Result<bool, Error> {
    let deleted = conn.execute(&format!("DELETE FROM {} WHERE key = ?1", store.table()), params![key])?;
    Ok(deleted > 0)
}

/// Delete every record in a collection. Returns how many were removed.
pub fn clear(conn: &rusqlite::Connection, store: Store) -> Result<u64, Error> {
    let deleted = conn.execute(&format!("DELETE FROM {}", store.table()), [])?;
    Ok(deleted as u64)
}

/// Count records matching an optional predicate.
pub fn count(conn: &rusqlite::Connection, store: Store, predicate: Option<&str>) -> Result<u64, Error> {
    let filter = predicate.map(|p| format!(" WHERE {p}")).unwrap_or_default();
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}{filter}", store.table()), [], |row| row.get(0))?;
    Ok(count as u64)
}

impl CacheDb {
    /// Run `op` inside a read transaction against `store`.
    ///
    /// Opens the connection first if this is the first call.
    pub async fn read_once<T, F>(&self, store: Store, op: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T, Error> + Send + 'static,
    {
        self.run_in_transaction(store, TransactionBehavior::Deferred, op).await
    }

    /// Run `op` inside a write transaction against `store`.
    ///
    /// The transaction commits only if `op` succeeds. `SQLITE_FULL` surfaces
    /// as [`Error::QuotaExceeded`]. No retries happen here.
    pub async fn write_once<T, F>(&self, store: Store, op: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T, Error> + Send + 'static,
    {
        self.run_in_transaction(store, TransactionBehavior::Immediate, op).await
    }

    async fn run_in_transaction<T, F>(&self, store: Store, behavior: TransactionBehavior, op: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T, Error> + Send + 'static,
    {
        let conn = self.connection().await?;
        let result = conn
            .call(move |conn| -> Result<T, Error> {
                let tx = conn.transaction_with_behavior(behavior)?;
                let out = op(&tx)?;
                tx.commit()?;
                Ok(out)
            })
            .await
            .map_err(Error::from);

        if let Err(e) = &result {
            tracing::debug!(store = %store, error = %e, "cache transaction failed");
        }
        result
    }

    /// Typed handle over one collection.
    pub fn collection<R: StoredRecord>(&self) -> Collection<R> {
        Collection { db: self.clone(), _record: PhantomData }
    }
}

/// Raw per-collection operations.
///
/// These bypass the retention policy; the document and search APIs on
/// [`CacheDb`] are the normal entry points.
#[derive(Debug, Clone)]
pub struct Collection<R> {
    db: CacheDb,
    _record: PhantomData<fn() -> R>,
}

impl<R: StoredRecord> Collection<R> {
    pub async fn get(&self, key: &str) -> Result<Option<R>, Error> {
        let key = key.to_string();
        self.db.read_once(R::STORE, move |tx| get::<R>(tx, &key)).await
    }

    pub async fn get_all(&self) -> Result<Vec<R>, Error> {
        self.db.read_once(R::STORE, |tx| get_all::<R>(tx)).await
    }

    pub async fn put(&self, record: R) -> Result<(), Error> {
        self.db.write_once(R::STORE, move |tx| put(tx, &record)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, Error> {
        let key = key.to_string();
        self.db.write_once(R::STORE, move |tx| delete(tx, R::STORE, &key)).await
    }

    pub async fn clear(&self) -> Result<u64, Error> {
        self.db.write_once(R::STORE, |tx| clear(tx, R::STORE)).await
    }
}
