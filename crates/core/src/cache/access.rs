//! Fire-and-forget bookkeeping that must never fail a read.

use chrono::{DateTime, Utc};
use tokio_rusqlite::params;

use super::connection::CacheDb;
use super::records::to_millis;
use super::schema::Store;

impl CacheDb {
    /// Persist one access to `key` in the background.
    ///
    /// `last_accessed` only moves forward, so bumps landing out of order
    /// still leave the newest time.
    pub(crate) fn track_access(&self, key: String, at: DateTime<Utc>) {
        let db = self.clone();
        self.spawn_background("access-tracking", async move {
            db.write_once(Store::DocumentMetadata, move |tx| {
                tx.execute(
                    "UPDATE document_metadata
                     SET last_accessed = MAX(last_accessed, ?1), access_count = access_count + 1
                     WHERE key = ?2",
                    params![to_millis(at), key],
                )?;
                Ok(())
            })
            .await
        });
    }

    /// Delete an expired cached document in the background.
    ///
    /// Re-checks expiry inside the transaction: a document saved or
    /// refreshed since the read is left alone.
    pub(crate) fn expire_lazily(&self, key: String, now: DateTime<Utc>) {
        let db = self.clone();
        self.spawn_background("lazy-expiration", async move {
            let removed = db
                .write_once(Store::DocumentMetadata, move |tx| {
                    let expired = "saved = 0 AND expires_at IS NOT NULL AND expires_at < ?2";
                    tx.execute(
                        &format!(
                            "DELETE FROM document_content WHERE key IN
                             (SELECT key FROM document_metadata WHERE key = ?1 AND {expired})"
                        ),
                        params![key, to_millis(now)],
                    )?;
                    let removed = tx.execute(
                        &format!("DELETE FROM document_metadata WHERE key = ?1 AND {expired}"),
                        params![key, to_millis(now)],
                    )?;
                    Ok(removed > 0)
                })
                .await?;
            if removed {
                tracing::debug!("removed expired document");
            }
            Ok(())
        });
    }
}
