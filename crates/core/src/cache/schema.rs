//! Store names and fixed schema constants.

use std::fmt;

/// Generation written into every record's `version` field.
pub const RECORD_VERSION: u32 = 2;

/// TTL used when a migration has to invent an expiry for a legacy cached row.
pub const LEGACY_DOCUMENT_TTL_DAYS: i64 = 7;

/// The logical collections backed by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Store {
    DocumentMetadata,
    DocumentContent,
    SearchCache,
}

impl Store {
    /// Table backing this collection.
    pub const fn table(self) -> &'static str {
        match self {
            Store::DocumentMetadata => "document_metadata",
            Store::DocumentContent => "document_content",
            Store::SearchCache => "search_cache",
        }
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}
