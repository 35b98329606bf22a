//! # plugsight-core
//!
//! Core library for plugsight - an embedded plugin discovery engine.
//!
//! This library provides:
//! - A plugin corpus indexed in SQLite with FTS5 full-text search
//! - TF-IDF postings, a co-install graph, and trending install velocity
//! - Relevance-ranked search with filters, fuzzy fallback, and suggestions
//! - Collaborative, content-based, and trending recommendations with a
//!   TTL cache
//! - Search/click/install analytics with gap tracking
//!
//! ## Architecture
//!
//! Everything persists in one SQLite file. Data flows in three stages:
//! - **Ingest:** manifest records land in the `plugins` table and its
//!   full-text projection
//! - **Derive:** maintenance passes rebuild postings, relationships, and
//!   trending scores (each in one transaction)
//! - **Serve:** search and recommendation read the derived tables and write
//!   back usage events that feed the next derivation
//!
//! ## Example
//!
//! ```rust,no_run
//! use plugsight_core::{Config, DiscoveryEngine};
//!
//! let config = Config::load().expect("failed to load config");
//! let engine = DiscoveryEngine::open(&Config::database_path(), config)
//!     .expect("failed to open engine");
//!
//! let response = engine.search("authentication", &Default::default());
//! assert!(response.success);
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use engine::{ApiResponse, DiscoveryEngine, ResponseMetadata};
pub use error::{Error, Result};
pub use types::*;

// Public modules
pub mod analytics;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod recommend;
pub mod search;
pub mod text;
pub mod types;
