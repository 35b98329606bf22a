//! Database layer for plugsight
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - An FTS5 full-text index kept in sync with the plugin corpus

pub mod repo;
pub mod schema;

pub use repo::{Database, FtsCandidate, InstallCounts, QueryCount};
