//! Chord sheet storage with saved/cached retention.
//!
//! A document is written in two steps: metadata first, then the body along
//! with the `content_available` flag. A crash between the two leaves a
//! metadata-only record that reads back without a body, never a body
//! without metadata.

use chrono::{DateTime, Duration, Utc};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::Connection;

use super::connection::CacheDb;
use super::executor::{clear, count, delete, get, get_all, put};
use super::key::{is_valid_key, try_document_key};
use super::records::{ChordSheet, Document, DocumentContent, DocumentMetadata, StorageInfo, to_millis};
use super::schema::Store;
use crate::Error;

/// How a write affects retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    /// Keep under the document TTL. An already saved record stays saved.
    Cache,
    /// Keep until explicitly unsaved or deleted.
    Save,
}

enum Lookup {
    Miss,
    Expired,
    Hit(Document),
}

fn key_for(artist: &str, title: &str) -> Result<String, Error> {
    try_document_key(artist, title)
        .ok_or_else(|| Error::InvalidKey(format!("no usable key for artist {artist:?}, title {title:?}")))
}

fn sheet_size(sheet: &ChordSheet) -> u64 {
    (sheet.artist.len() + sheet.title.len() + sheet.body.len()) as u64
}

impl CacheDb {
    /// Store a freshly fetched sheet under the document TTL.
    ///
    /// Overwriting keeps first-stored time and access history. Calling this
    /// on a saved document refreshes its content and leaves it saved.
    pub async fn cache_document(&self, sheet: ChordSheet) -> Result<DocumentMetadata, Error> {
        self.write_document(sheet, Intent::Cache).await
    }

    /// Store a sheet and mark it saved.
    pub async fn save_document(&self, sheet: ChordSheet) -> Result<DocumentMetadata, Error> {
        self.write_document(sheet, Intent::Save).await
    }

    async fn write_document(&self, sheet: ChordSheet, intent: Intent) -> Result<DocumentMetadata, Error> {
        let key = key_for(&sheet.artist, &sheet.title)?;
        let estimated = sheet_size(&sheet);
        self.admit_write(estimated).await;

        let ttl = self.config().document_ttl();
        let meta = self
            .with_quota_retry(estimated.saturating_mul(2), || {
                self.write_document_once(key.clone(), sheet.clone(), intent, ttl)
            })
            .await?;
        tracing::debug!(key = %meta.key, saved = meta.storage.saved, "stored document");
        Ok(meta)
    }

    async fn write_document_once(
        &self, key: String, sheet: ChordSheet, intent: Intent, ttl: Duration,
    ) -> Result<DocumentMetadata, Error> {
        let now = Utc::now();
        let ChordSheet { artist, title, song_key, tuning, capo, body } = sheet;

        let metadata_key = key.clone();
        let mut meta = self
            .write_once(Store::DocumentMetadata, move |tx| {
                let mut storage = match get::<DocumentMetadata>(tx, &metadata_key)? {
                    Some(existing) => existing.storage,
                    None if intent == Intent::Save => StorageInfo::new_saved(now),
                    None => StorageInfo::new_cached(now, ttl),
                };
                match intent {
                    Intent::Cache => storage.refresh(now, ttl),
                    Intent::Save => storage.mark_saved(now),
                }
                let meta = DocumentMetadata { key: metadata_key, title, artist, song_key, tuning, capo, storage };
                put(tx, &meta)?;
                Ok(meta)
            })
            .await?;

        let content = DocumentContent { key, body };
        self.write_once(Store::DocumentContent, move |tx| {
            put(tx, &content)?;
            tx.execute("UPDATE document_metadata SET content_available = 1 WHERE key = ?1", params![content.key])?;
            Ok(())
        })
        .await?;
        meta.storage.content_available = true;
        Ok(meta)
    }

    /// Mark an already stored document saved, without new content.
    ///
    /// Returns `None` when there is nothing stored under that artist and title.
    pub async fn save_existing(&self, artist: &str, title: &str) -> Result<Option<DocumentMetadata>, Error> {
        let Some(key) = try_document_key(artist, title) else {
            return Ok(None);
        };
        let now = Utc::now();
        self.write_once(Store::DocumentMetadata, move |tx| {
            let Some(mut meta) = get::<DocumentMetadata>(tx, &key)? else {
                return Ok(None);
            };
            meta.storage.mark_saved(now);
            put(tx, &meta)?;
            Ok(Some(meta))
        })
        .await
    }

    /// Turn a saved document back into a cached one, expiring one TTL from now.
    pub async fn unsave_document(&self, artist: &str, title: &str) -> Result<Option<DocumentMetadata>, Error> {
        let Some(key) = try_document_key(artist, title) else {
            return Ok(None);
        };
        let now = Utc::now();
        let ttl = self.config().document_ttl();
        self.write_once(Store::DocumentMetadata, move |tx| {
            let Some(mut meta) = get::<DocumentMetadata>(tx, &key)? else {
                return Ok(None);
            };
            if meta.storage.saved {
                meta.storage.mark_cached(now, ttl);
                put(tx, &meta)?;
            }
            Ok(Some(meta))
        })
        .await
    }

    /// Read a document by artist and title. See [`Self::get_document_by_key`].
    pub async fn get_document(&self, artist: &str, title: &str) -> Result<Option<Document>, Error> {
        match try_document_key(artist, title) {
            Some(key) => self.get_document_by_key(&key).await,
            None => Ok(None),
        }
    }

    /// Read a document with its body.
    ///
    /// An expired cached document reads as a miss and is deleted in the
    /// background. A hit comes back with its access already counted; the
    /// persisted bump happens in the background.
    pub async fn get_document_by_key(&self, key: &str) -> Result<Option<Document>, Error> {
        if !is_valid_key(key) {
            return Ok(None);
        }
        let now = Utc::now();
        let lookup_key = key.to_string();
        let lookup = self
            .read_once(Store::DocumentMetadata, move |tx| {
                let Some(metadata) = get::<DocumentMetadata>(tx, &lookup_key)? else {
                    return Ok(Lookup::Miss);
                };
                if metadata.storage.is_expired(now) {
                    return Ok(Lookup::Expired);
                }
                let body = if metadata.storage.content_available {
                    get::<DocumentContent>(tx, &lookup_key)?.map(|c| c.body)
                } else {
                    None
                };
                Ok(Lookup::Hit(Document { metadata, body }))
            })
            .await?;

        match lookup {
            Lookup::Miss => Ok(None),
            Lookup::Expired => {
                tracing::debug!(key, "document expired on read");
                self.expire_lazily(key.to_string(), now);
                Ok(None)
            }
            Lookup::Hit(mut document) => {
                document.metadata.storage.touch(now);
                self.track_access(key.to_string(), now);
                Ok(Some(document))
            }
        }
    }

    /// Metadata only, without counting an access. Expired records read as a miss.
    pub async fn get_document_metadata(&self, artist: &str, title: &str) -> Result<Option<DocumentMetadata>, Error> {
        let Some(key) = try_document_key(artist, title) else {
            return Ok(None);
        };
        let now = Utc::now();
        let meta = self.collection::<DocumentMetadata>().get(&key).await?;
        Ok(meta.filter(|m| !m.storage.is_expired(now)))
    }

    /// Body only, without counting an access. Expired records read as a miss.
    pub async fn get_document_content(&self, artist: &str, title: &str) -> Result<Option<String>, Error> {
        let Some(key) = try_document_key(artist, title) else {
            return Ok(None);
        };
        let now = Utc::now();
        self.read_once(Store::DocumentContent, move |tx| {
            match get::<DocumentMetadata>(tx, &key)? {
                Some(meta) if !meta.storage.is_expired(now) => Ok(get::<DocumentContent>(tx, &key)?.map(|c| c.body)),
                _ => Ok(None),
            }
        })
        .await
    }

    /// Every unexpired document's metadata, ordered by key.
    ///
    /// Expired cached documents are left out and deleted in the background.
    pub async fn list_documents(&self) -> Result<Vec<DocumentMetadata>, Error> {
        let now = Utc::now();
        let all = self.read_once(Store::DocumentMetadata, |tx| get_all::<DocumentMetadata>(tx)).await?;
        let (expired, live): (Vec<_>, Vec<_>) = all.into_iter().partition(|m| m.storage.is_expired(now));
        for meta in expired {
            self.expire_lazily(meta.key, now);
        }
        Ok(live)
    }

    /// Saved documents only, ordered by key.
    pub async fn list_saved_documents(&self) -> Result<Vec<DocumentMetadata>, Error> {
        let mut saved = self.list_documents().await?;
        saved.retain(|m| m.storage.saved);
        Ok(saved)
    }

    /// Delete a document regardless of retention state. Returns whether it existed.
    pub async fn delete_document(&self, artist: &str, title: &str) -> Result<bool, Error> {
        let Some(key) = try_document_key(artist, title) else {
            return Ok(false);
        };
        self.write_once(Store::DocumentMetadata, move |tx| {
            delete(tx, Store::DocumentContent, &key)?;
            delete(tx, Store::DocumentMetadata, &key)
        })
        .await
    }

    /// Delete every document, saved or not. Returns how many were removed.
    pub async fn clear_documents(&self) -> Result<u64, Error> {
        self.write_once(Store::DocumentMetadata, |tx| {
            clear(tx, Store::DocumentContent)?;
            clear(tx, Store::DocumentMetadata)
        })
        .await
    }

    /// Delete cached documents whose TTL has passed as of `now`. Saved
    /// documents are never touched.
    pub async fn purge_expired_documents(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let at = to_millis(now);
        let purged = self
            .write_once(Store::DocumentMetadata, move |tx| {
                let expired = "saved = 0 AND expires_at IS NOT NULL AND expires_at < ?1";
                let n = count_expired(tx, at)?;
                tx.execute(
                    &format!("DELETE FROM document_content WHERE key IN (SELECT key FROM document_metadata WHERE {expired})"),
                    params![at],
                )?;
                tx.execute(&format!("DELETE FROM document_metadata WHERE {expired}"), params![at])?;
                Ok(n)
            })
            .await?;
        if purged > 0 {
            tracing::info!(purged, "purged expired documents");
        }
        Ok(purged)
    }

    /// Number of saved and of cached documents.
    pub async fn document_counts(&self) -> Result<(u64, u64), Error> {
        self.read_once(Store::DocumentMetadata, |tx| {
            let saved = count(tx, Store::DocumentMetadata, Some("saved = 1"))?;
            let cached = count(tx, Store::DocumentMetadata, Some("saved = 0"))?;
            Ok((saved, cached))
        })
        .await
    }
}

fn count_expired(conn: &Connection, at: i64) -> Result<u64, Error> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM document_metadata WHERE saved = 0 AND expires_at IS NOT NULL AND expires_at < ?1",
        params![at],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}
