//! Canonical cache key generation.
//!
//! Documents are keyed by a slash-separated path `owner/document`, where each
//! part is folded to lowercase ASCII-ish slugs: diacritics stripped,
//! punctuation dropped, and runs of whitespace or separators collapsed into a
//! single `-`. The older flat `owner_document` identifiers are only ever read
//! back through [`resolve_legacy_key`] during consolidation.

use std::collections::BTreeMap;

use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

/// Sentinel returned for unusable input. Never stored; lookups treat it as a miss.
pub const INVALID_KEY: &str = "invalid/invalid";

/// Separator between the owner part and the document part.
pub const PART_SEPARATOR: char = '/';

const DELIMITER: char = '-';

const SEARCH_PREFIX: &str = "search/";

/// Fold a free-text string into a key segment.
///
/// Returns an empty string when nothing usable remains.
pub fn normalize_segment(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_delimiter = false;

    for c in input.nfd().filter(|c| !is_combining_mark(*c)) {
        if c.is_alphanumeric() {
            if pending_delimiter && !out.is_empty() {
                out.push(DELIMITER);
            }
            pending_delimiter = false;
            out.extend(c.to_lowercase());
        } else if c.is_whitespace() || is_separator(c) {
            pending_delimiter = true;
        }
        // quotes, brackets and other punctuation are dropped without splitting words
    }

    out
}

fn is_separator(c: char) -> bool {
    matches!(c, '-' | '_' | '/' | '\\' | '|' | '+' | '&' | ',' | ';' | ':' | '~' | '–' | '—')
}

/// Canonical key for an (owner, document) pair, or `None` if either part
/// normalizes to nothing.
pub fn try_document_key(owner: &str, document: &str) -> Option<String> {
    let owner = normalize_segment(owner);
    let document = normalize_segment(document);
    if owner.is_empty() || document.is_empty() {
        return None;
    }
    Some(format!("{owner}{PART_SEPARATOR}{document}"))
}

/// Canonical key for an (owner, document) pair.
///
/// Total: unusable input yields [`INVALID_KEY`] instead of an error.
pub fn document_key(owner: &str, document: &str) -> String {
    try_document_key(owner, document).unwrap_or_else(|| INVALID_KEY.to_string())
}

/// Whether `key` is a usable document key.
pub fn is_valid_key(key: &str) -> bool {
    key != INVALID_KEY && key.split_once(PART_SEPARATOR).is_some_and(|(o, d)| !o.is_empty() && !d.is_empty())
}

/// Map a stored key in either the canonical or the legacy flat form onto the
/// canonical form.
///
/// Legacy keys look like `owner_document` with `-` inside each part. The
/// split happens at the first `_`, so owners that themselves contained an
/// underscore resolve ambiguously; consolidation prefers the owner and
/// title recorded in the metadata and only falls back to this.
pub fn resolve_legacy_key(stored: &str) -> Option<String> {
    if let Some((owner, document)) = stored.split_once(PART_SEPARATOR) {
        return try_document_key(owner, document);
    }
    let (owner, document) = stored.split_once('_')?;
    try_document_key(owner, document)
}

/// Key for a cached search result set.
///
/// Parameters are sorted by name and each value is folded with the same
/// normalizer as document keys, so `{artist: "Hillsong"}` and
/// `{artist: "hillsong "}` share one entry. Empty values are ignored.
pub fn search_key(params: &BTreeMap<String, String>) -> String {
    let normalized: BTreeMap<String, String> = params
        .iter()
        .map(|(name, value)| (normalize_segment(name), normalize_segment(value)))
        .filter(|(name, value)| !name.is_empty() && !value.is_empty())
        .collect();
    let parts: Vec<String> = normalized.iter().map(|(name, value)| format!("{name}={value}")).collect();

    if parts.is_empty() {
        return format!("{SEARCH_PREFIX}all");
    }
    format!("{SEARCH_PREFIX}{}", parts.join("&"))
}
