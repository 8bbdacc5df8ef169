//! Core types and shared functionality for chordcache.
//!
//! This crate provides:
//! - Persistent chord sheet and search result cache with SQLite backend
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{CacheDb, ChordSheet, CleanupReport, Document, DocumentMetadata, SearchCacheEntry};
pub use config::{AppConfig, ConfigError};
pub use error::Error;
