//! Discovery engine facade
//!
//! Wires the indexer, search, recommendation, and analytics components over
//! one database handle, and wraps every public operation in a uniform
//! response envelope with timing, a success flag, and a short error string.
//! Raw storage errors never cross this boundary; they are logged here and
//! mapped to user-facing messages.

use crate::analytics::{AnalyticsCollector, AnalyticsSummary};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::indexer::Indexer;
use crate::recommend::{RecommendOutcome, RecommendationEngine};
use crate::search::SearchEngine;
use crate::text::{self, Normalizer};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Envelope metadata attached to every response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub timestamp: DateTime<Utc>,
    pub execution_time_ms: u64,
    /// True only when a recommendation operation hit its cache
    pub cached: bool,
}

/// Uniform request/response wrapper returned by every public operation.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub metadata: ResponseMetadata,
}

impl<T> ApiResponse<T> {
    fn ok(data: T, started: Instant, cached: bool) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: ResponseMetadata {
                timestamp: Utc::now(),
                execution_time_ms: started.elapsed().as_millis() as u64,
                cached,
            },
        }
    }

    fn err(error: &Error, started: Instant) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.user_message()),
            metadata: ResponseMetadata {
                timestamp: Utc::now(),
                execution_time_ms: started.elapsed().as_millis() as u64,
                cached: false,
            },
        }
    }
}

/// The embedded plugin discovery engine.
///
/// ## Example
///
/// ```rust,no_run
/// use plugsight_core::{Config, DiscoveryEngine};
///
/// let engine = DiscoveryEngine::open(&Config::database_path(), Config::load().unwrap()).unwrap();
/// let response = engine.search("authentication", &Default::default());
/// assert!(response.success);
/// ```
pub struct DiscoveryEngine {
    db: Arc<Database>,
    indexer: Indexer,
    search: SearchEngine,
    recommender: RecommendationEngine,
    analytics: AnalyticsCollector,
}

impl DiscoveryEngine {
    /// Open (or create) the engine over a database file.
    pub fn open(path: &PathBuf, config: Config) -> Result<Self> {
        let db = Arc::new(Database::open(path)?);
        Self::with_database(db, config)
    }

    /// Open the engine over an in-memory database (for testing).
    pub fn open_in_memory(config: Config) -> Result<Self> {
        let db = Arc::new(Database::open_in_memory()?);
        Self::with_database(db, config)
    }

    fn with_database(db: Arc<Database>, config: Config) -> Result<Self> {
        config.validate()?;
        if let Some(expected) = &config.indexing.stopword_fingerprint {
            let actual = text::stopword_fingerprint();
            if *expected != actual {
                return Err(Error::Config(format!(
                    "stop-word fingerprint mismatch: expected {}, built with {}",
                    expected, actual
                )));
            }
        }
        db.migrate()?;

        let normalizer = Normalizer::new(config.indexing.stemming);
        let indexer = Indexer::new(db.clone(), normalizer.clone(), config.trending);
        let search = SearchEngine::new(db.clone(), normalizer, config.scoring, config.search);
        let recommender = RecommendationEngine::new(db.clone(), config.cache);
        let analytics = AnalyticsCollector::new(db.clone());

        Ok(Self {
            db,
            indexer,
            search,
            recommender,
            analytics,
        })
    }

    // ============================================
    // Ingest API
    // ============================================

    /// Upsert one plugin manifest.
    pub fn index_plugin(&self, record: &PluginRecord) -> ApiResponse<()> {
        self.run("index_plugin", || self.indexer.index_plugin(record))
    }

    /// Bulk ingest with optional maintenance passes.
    pub fn build_index(
        &self,
        records: &[PluginRecord],
        options: &BuildOptions,
    ) -> ApiResponse<BuildReport> {
        self.run("build_index", || {
            self.indexer.build_index(records, options)
        })
    }

    /// TF-IDF refresh: incremental over the queue when one is pending,
    /// otherwise a full recompute. Returns postings written.
    pub fn update_tfidf(&self) -> ApiResponse<usize> {
        self.run("update_tfidf", || {
            if self.db.index_stats()?.queued_for_reindex > 0 {
                self.indexer.update_tfidf_incremental()
            } else {
                self.indexer.update_tfidf()
            }
        })
    }

    /// Rebuild the co-install graph. Returns edges written.
    pub fn update_relationships(&self) -> ApiResponse<usize> {
        self.run("update_relationships", || {
            self.indexer.update_relationships()
        })
    }

    /// Refresh trending velocity scores. Returns rows written.
    pub fn update_trending(&self) -> ApiResponse<usize> {
        self.run("update_trending", || self.indexer.update_trending())
    }

    /// Reclaim space and refresh store statistics.
    pub fn optimize(&self) -> ApiResponse<()> {
        self.run("optimize", || self.indexer.optimize())
    }

    /// Delete search events older than `days_to_keep` days.
    pub fn cleanup(&self, days_to_keep: i64) -> ApiResponse<usize> {
        self.run("cleanup", || self.analytics.cleanup(days_to_keep))
    }

    // ============================================
    // Query API
    // ============================================

    pub fn search(&self, query: &str, options: &SearchOptions) -> ApiResponse<SearchResponse> {
        self.run("search", || self.search.search(query, options))
    }

    pub fn fuzzy_search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> ApiResponse<SearchResponse> {
        self.run("fuzzy_search", || {
            self.search.fuzzy_search(query, options)
        })
    }

    pub fn suggestions(&self, partial: &str, limit: usize) -> ApiResponse<Vec<String>> {
        self.run("suggestions", || {
            self.search.suggestions(partial, limit)
        })
    }

    /// Personalized recommendations; `metadata.cached` reports a cache hit.
    pub fn recommend(&self, context: &RecommendationContext) -> ApiResponse<Vec<Recommendation>> {
        self.run_recommendation("recommend", || self.recommender.recommend(context))
    }

    /// Plugins trending by install velocity.
    pub fn trending(
        &self,
        period: TrendingPeriod,
        limit: usize,
    ) -> ApiResponse<Vec<Recommendation>> {
        self.run_recommendation("trending", || self.recommender.trending(period, limit))
    }

    /// Plugins similar to one plugin.
    pub fn similar(&self, plugin_id: &str, limit: usize) -> ApiResponse<Vec<Recommendation>> {
        self.run_recommendation("similar", || self.recommender.similar(plugin_id, limit))
    }

    /// Category metadata with live plugin counts.
    pub fn categories(&self) -> ApiResponse<Vec<CategoryInfo>> {
        self.run("categories", || self.db.list_categories())
    }

    /// Most-downloaded plugins.
    pub fn popular(&self, limit: usize) -> ApiResponse<Vec<PluginRecord>> {
        self.run("popular", || self.db.popular(limit))
    }

    /// Most recently updated plugins.
    pub fn recently_updated(&self, limit: usize) -> ApiResponse<Vec<PluginRecord>> {
        self.run("recently_updated", || self.db.recently_updated(limit))
    }

    /// Featured plugins.
    pub fn featured(&self, limit: usize) -> ApiResponse<Vec<PluginRecord>> {
        self.run("featured", || self.db.featured(limit))
    }

    // ============================================
    // Event recording
    // ============================================

    pub fn record_install(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        version: Option<&str>,
        source: Option<&str>,
    ) -> ApiResponse<()> {
        self.run("record_install", || {
            self.recommender
                .record_install(plugin_id, user_id, version, source)
        })
    }

    /// Returns whether an open install was actually closed.
    pub fn record_uninstall(&self, plugin_id: &str, user_id: Option<&str>) -> ApiResponse<bool> {
        self.run("record_uninstall", || {
            self.recommender.record_uninstall(plugin_id, user_id)
        })
    }

    /// Returns whether a matching search event was found to attach to.
    pub fn record_click(
        &self,
        query: &str,
        plugin_id: &str,
        position: i64,
        session_id: Option<&str>,
    ) -> ApiResponse<bool> {
        self.run("record_click", || {
            self.search.record_click(query, plugin_id, position, session_id)
        })
    }

    /// Fold one rating observation into a plugin's running average.
    pub fn record_rating(&self, plugin_id: &str, rating: f64) -> ApiResponse<()> {
        self.run("record_rating", || {
            if !(0.0..=5.0).contains(&rating) {
                return Err(Error::Validation(format!(
                    "rating {} outside [0, 5]",
                    rating
                )));
            }
            if !self.db.apply_rating(plugin_id, rating)? {
                return Err(Error::PluginNotFound(plugin_id.to_string()));
            }
            Ok(())
        })
    }

    // ============================================
    // Introspection
    // ============================================

    /// On-demand analytics bundle over the trailing window.
    pub fn get_analytics(&self, days_back: i64) -> ApiResponse<AnalyticsSummary> {
        self.run("get_analytics", || self.analytics.summary(days_back))
    }

    /// Index health counters.
    pub fn index_stats(&self) -> ApiResponse<IndexStats> {
        self.run("index_stats", || self.indexer.index_stats())
    }

    /// True when the index was built with a different stop-word list.
    pub fn needs_reindex(&self) -> ApiResponse<bool> {
        self.run("needs_reindex", || self.indexer.needs_reindex())
    }

    // ============================================
    // Envelope plumbing
    // ============================================

    fn run<T>(&self, op: &str, f: impl FnOnce() -> Result<T>) -> ApiResponse<T> {
        // attach the operation to every log line emitted underneath
        let _span = tracing::debug_span!("engine_op", op).entered();
        let started = Instant::now();
        match f() {
            Ok(data) => ApiResponse::ok(data, started, false),
            Err(e) => {
                tracing::error!(op, error = %e, "Operation failed");
                ApiResponse::err(&e, started)
            }
        }
    }

    fn run_recommendation(
        &self,
        op: &str,
        f: impl FnOnce() -> Result<RecommendOutcome>,
    ) -> ApiResponse<Vec<Recommendation>> {
        let _span = tracing::debug_span!("engine_op", op).entered();
        let started = Instant::now();
        match f() {
            Ok(outcome) => ApiResponse::ok(outcome.items, started, outcome.cached),
            Err(e) => {
                tracing::error!(op, error = %e, "Operation failed");
                ApiResponse::err(&e, started)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DiscoveryEngine {
        DiscoveryEngine::open_in_memory(Config::default()).unwrap()
    }

    fn plugin(id: &str, name: &str) -> PluginRecord {
        let mut p = PluginRecord::new(id, name, Category::Agents);
        p.description = Some(format!("{} description", name));
        p
    }

    #[test]
    fn test_envelope_success_shape() {
        let engine = engine();
        let response = engine.index_plugin(&plugin("p1", "auth-agent"));
        assert!(response.success);
        assert!(response.error.is_none());
        assert!(!response.metadata.cached);
    }

    #[test]
    fn test_envelope_error_hides_storage_details() {
        let engine = engine();
        let response = engine.similar("ghost", 5);
        assert!(!response.success);
        assert!(response.data.is_none());
        assert_eq!(response.error.as_deref(), Some("plugin not found: ghost"));
    }

    #[test]
    fn test_envelope_validation_error() {
        let engine = engine();
        let response = engine.record_rating("p1", 9.0);
        assert!(!response.success);
        assert!(response.error.unwrap().contains("outside [0, 5]"));
    }

    #[test]
    fn test_cached_flag_only_on_cache_hits() {
        let engine = engine();
        engine.index_plugin(&plugin("p1", "auth-agent"));
        engine.update_trending();

        let first = engine.trending(TrendingPeriod::Week, 5);
        assert!(first.success);
        assert!(!first.metadata.cached);

        let second = engine.trending(TrendingPeriod::Week, 5);
        assert!(second.success);
        assert!(second.metadata.cached);
    }

    #[test]
    fn test_fingerprint_pin_mismatch_fails_startup() {
        let mut config = Config::default();
        config.indexing.stopword_fingerprint = Some("deadbeef".to_string());
        assert!(matches!(
            DiscoveryEngine::open_in_memory(config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_end_to_end_search_envelope() {
        let engine = engine();
        engine.index_plugin(&plugin("p1", "auth-agent"));
        engine.update_tfidf();

        let response = engine.search("auth", &SearchOptions::default());
        assert!(response.success);
        let page = response.data.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0].plugin.id, "p1");
    }

    #[test]
    fn test_record_rating_folds_average() {
        let engine = engine();
        engine.index_plugin(&plugin("p1", "auth-agent"));
        assert!(engine.record_rating("p1", 4.0).success);
        assert!(engine.record_rating("p1", 2.0).success);

        let stored = engine.db.get_plugin("p1").unwrap().unwrap();
        assert!((stored.rating - 3.0).abs() < 1e-9);
        assert_eq!(stored.rating_count, 2);
    }
}
