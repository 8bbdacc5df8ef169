//! Database connection management with pragma configuration.
//!
//! This module handles opening the SQLite database, applying required pragmas
//! for performance and concurrency (WAL mode), and running migrations. The
//! connection is opened lazily behind a single-flight cell: concurrent first
//! callers all await the same open attempt.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;
use tokio::sync::{OnceCell, broadcast};
use tokio::task::JoinSet;
use tokio_rusqlite::Connection;

use super::eviction::CleanupReport;
use super::migrations::{self, MigrationReport};
use super::usage::{PageCountUsage, UsageProbe};
use crate::Error;
use crate::config::AppConfig;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA foreign_keys=ON;";

const CLEANUP_EVENT_CAPACITY: usize = 16;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    File(PathBuf),
    Memory,
}

struct Opened {
    conn: Connection,
    report: MigrationReport,
}

pub(crate) struct Inner {
    location: Location,
    pub(crate) config: AppConfig,
    opened: OnceCell<Opened>,
    pub(crate) usage_probe: Arc<dyn UsageProbe>,
    background: Mutex<JoinSet<()>>,
    pub(crate) cleanup_events: broadcast::Sender<CleanupReport>,
    pub(crate) cleanup_running: AtomicBool,
}

/// Cache database handle.
///
/// Cheap to clone; clones share the connection, background tasks and
/// cleanup event channel. The underlying tokio-rusqlite Connection runs
/// database operations on a background thread.
#[derive(Clone)]
pub struct CacheDb {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for CacheDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheDb")
            .field("location", &self.inner.location)
            .field("open", &self.inner.opened.initialized())
            .finish_non_exhaustive()
    }
}

/// Builder for [`CacheDb`].
pub struct CacheDbBuilder {
    config: AppConfig,
    location: Location,
    usage_probe: Option<Arc<dyn UsageProbe>>,
}

impl CacheDbBuilder {
    /// Use a private in-memory database instead of `config.db_path`.
    pub fn in_memory(mut self) -> Self {
        self.location = Location::Memory;
        self
    }

    /// Replace the default page-count usage estimate.
    pub fn usage_probe(mut self, probe: impl UsageProbe + 'static) -> Self {
        self.usage_probe = Some(Arc::new(probe));
        self
    }

    /// Build a handle without touching the database. The first operation opens it.
    pub fn build(self) -> CacheDb {
        let (cleanup_events, _) = broadcast::channel(CLEANUP_EVENT_CAPACITY);
        CacheDb {
            inner: Arc::new(Inner {
                location: self.location,
                config: self.config,
                opened: OnceCell::new(),
                usage_probe: self.usage_probe.unwrap_or_else(|| Arc::new(PageCountUsage)),
                background: Mutex::new(JoinSet::new()),
                cleanup_events,
                cleanup_running: AtomicBool::new(false),
            }),
        }
    }

    /// Build a handle and open the database eagerly.
    pub async fn open(self) -> Result<CacheDb, Error> {
        let db = self.build();
        db.connection().await?;
        Ok(db)
    }
}

impl CacheDb {
    /// Start building a handle for `config.db_path`.
    pub fn builder(config: AppConfig) -> CacheDbBuilder {
        let location = Location::File(config.db_path.clone());
        CacheDbBuilder { config, location, usage_probe: None }
    }

    /// Open the database described by `config`.
    ///
    /// Creates the file if it doesn't exist, applies performance pragmas,
    /// and runs any pending migrations.
    pub async fn open(config: AppConfig) -> Result<Self, Error> {
        Self::builder(config).open().await
    }

    /// Open an in-memory database with default settings.
    pub async fn open_in_memory() -> Result<Self, Error> {
        Self::builder(AppConfig::default()).in_memory().open().await
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// The shared connection, opening it on first use.
    pub(crate) async fn connection(&self) -> Result<&Connection, Error> {
        let opened = self
            .inner
            .opened
            .get_or_try_init(|| open_connection(&self.inner.location, &self.inner.config))
            .await?;
        Ok(&opened.conn)
    }

    /// Report produced by the migrations run while opening.
    pub async fn migration_report(&self) -> Result<MigrationReport, Error> {
        self.connection().await?;
        Ok(self.inner.opened.get().map(|o| o.report.clone()).unwrap_or_default())
    }

    /// Run pending schema migrations and unfinished data transforms.
    ///
    /// A second call after a fully successful run reports nothing migrated.
    pub async fn migrate(&self) -> Result<MigrationReport, Error> {
        let conn = self.connection().await?;
        migrations::run(conn).await
    }

    /// Spawn fire-and-forget work. Failures are logged, never returned.
    pub(crate) fn spawn_background<F>(&self, task: &'static str, work: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let mut tasks = self.inner.background.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(e) = work.await {
                tracing::warn!(task, error = %e, "background cache task failed");
            }
        });
    }

    /// Wait for every background task spawned so far (access bumps, lazy
    /// deletes, opportunistic cleanup runs) to finish.
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.inner.background.lock());
            if pending.is_empty() {
                break;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "background cache task panicked or was cancelled");
                }
            }
        }
    }
}

async fn open_connection(location: &Location, config: &AppConfig) -> Result<Opened, Error> {
    let conn = match location {
        Location::File(path) => Connection::open(path).await,
        Location::Memory => Connection::open_in_memory().await,
    }
    .map_err(|e| Error::Connection(e.to_string()))?;

    let quota_bytes = config.quota_bytes;
    conn.call(move |conn| {
        conn.execute_batch(PRAGMAS)?;
        if let Some(quota) = quota_bytes {
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let pages = (quota as i64 / page_size.max(1)).max(1);
            conn.execute_batch(&format!("PRAGMA max_page_count = {pages};"))?;
        }
        Ok(())
    })
    .await
    .map_err(|e: tokio_rusqlite::Error| Error::Connection(e.to_string()))?;

    let report = migrations::run(&conn).await?;
    tracing::info!(
        from_version = report.from_version,
        to_version = report.to_version,
        migrated = report.migrated_count,
        errors = report.errors.len(),
        "cache database opened"
    );

    Ok(Opened { conn, report })
}
