//! MCP tool implementations.
//!
//! This module contains all tools exposed by the chordcache server.

pub mod cache;
