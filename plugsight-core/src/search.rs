//! Search engine: full-text lookup, multi-signal scoring, and analytics capture
//!
//! Queries are normalized with the same tokenizer that built the postings,
//! matched against the FTS index as a disjunction of stems, then scored by a
//! weighted blend of TF-IDF, downloads, rating, recency, and name-match
//! boosts. Analytics writes are best-effort: a failed event insert is logged
//! and swallowed, never the caller's problem.

use crate::config::{ScoringConfig, SearchConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::text::{Normalized, Normalizer};
use crate::types::*;
use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;

const SECONDS_PER_YEAR: f64 = 365.25 * 86_400.0;

/// Resolves queries against the full-text index and records search events.
pub struct SearchEngine {
    db: Arc<Database>,
    normalizer: Normalizer,
    weights: ScoringConfig,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(
        db: Arc<Database>,
        normalizer: Normalizer,
        weights: ScoringConfig,
        config: SearchConfig,
    ) -> Self {
        Self {
            db,
            normalizer,
            weights,
            config,
        }
    }

    // ============================================
    // Public operations
    // ============================================

    /// Exact search: stems ORed against the index, scored, sorted, paginated.
    /// An empty normalized query returns an empty page and records nothing.
    pub fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        validate_options(options)?;
        let normalized = self.normalizer.normalize(query);
        if normalized.stems.is_empty() {
            return Ok(SearchResponse::empty(query, options));
        }

        let match_expr = exact_match_expr(&normalized.stems);
        let response = self.execute(query, &normalized, &match_expr, options)?;
        self.record_analytics(query, &response, options);
        Ok(response)
    }

    /// Fuzzy search: exact first; when that comes back thin, retry with each
    /// stem expanded to a prefix match. Graceful degradation on typos and
    /// partial words, not an edit-distance neighborhood.
    pub fn fuzzy_search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        validate_options(options)?;
        let normalized = self.normalizer.normalize(query);
        if normalized.stems.is_empty() {
            return Ok(SearchResponse::empty(query, options));
        }

        let exact = self.execute(query, &normalized, &exact_match_expr(&normalized.stems), options)?;
        if exact.total >= self.config.fuzzy_min_results {
            self.record_analytics(query, &exact, options);
            return Ok(exact);
        }

        let expanded = self.execute(
            query,
            &normalized,
            &prefix_match_expr(&normalized.stems),
            options,
        )?;
        self.record_analytics(query, &expanded, options);
        Ok(expanded)
    }

    /// Name suggestions for a partial query, ordered by downloads.
    pub fn suggestions(&self, partial: &str, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Err(Error::Validation("limit must be at least 1".to_string()));
        }
        let normalized = self.normalizer.normalize(partial);
        let Some(last_stem) = normalized.stems.last() else {
            return Ok(Vec::new());
        };
        self.db.suggest_names(last_stem, limit)
    }

    /// Attach a click to the most recent matching search event. Returns
    /// false (without inventing an event) when none matches.
    pub fn record_click(
        &self,
        query: &str,
        plugin_id: &str,
        position: i64,
        session_id: Option<&str>,
    ) -> Result<bool> {
        if position < 1 {
            return Err(Error::Validation(format!(
                "click position must be >= 1 (got {})",
                position
            )));
        }
        if plugin_id.trim().is_empty() {
            return Err(Error::Validation("plugin id must not be empty".to_string()));
        }
        self.db.record_click(query, plugin_id, position, session_id)
    }

    // ============================================
    // Query execution
    // ============================================

    fn execute(
        &self,
        raw_query: &str,
        normalized: &Normalized,
        match_expr: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse> {
        let candidates = self.db.fulltext_candidates(match_expr, &options.filters)?;
        if candidates.is_empty() {
            return Ok(SearchResponse::empty(raw_query, options));
        }

        let ids: Vec<String> = candidates.iter().map(|c| c.plugin.id.clone()).collect();
        let tfidf_sums = self.db.tfidf_sums(&ids, &normalized.stems)?;
        let max_tfidf = tfidf_sums.values().cloned().fold(0.0_f64, f64::max);
        let max_downloads = candidates
            .iter()
            .map(|c| c.plugin.downloads)
            .max()
            .unwrap_or(0)
            .max(1) as f64;

        let now = Utc::now();
        let raw = raw_query.trim().to_lowercase();

        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .map(|candidate| {
                let plugin = candidate.plugin;
                let tfidf_raw = tfidf_sums.get(&plugin.id).copied().unwrap_or(0.0);
                let tfidf_score = if max_tfidf > 0.0 { tfidf_raw / max_tfidf } else { 0.0 };
                let download_score = plugin.downloads as f64 / max_downloads;
                let rating_score = plugin.rating / 5.0;
                let recency_score = plugin
                    .published_at
                    .map(|published| {
                        let age_years =
                            (now - published).num_seconds() as f64 / SECONDS_PER_YEAR;
                        (1.0 - age_years).max(0.0)
                    })
                    .unwrap_or(0.0);
                let boost = relevance_boost(&plugin, &raw);

                let score = self.weights.tfidf_weight * tfidf_score
                    + self.weights.download_weight * download_score
                    + self.weights.rating_weight * rating_score
                    + self.weights.recency_weight * recency_score
                    + self.weights.relevance_weight * boost;

                let matched_fields = matched_fields(&plugin, &normalized.tokens);
                SearchResult {
                    plugin,
                    score,
                    matched_fields,
                }
            })
            .collect();

        sort_results(&mut results, options.sort, options.order);

        let total = results.len();
        let mut page: Vec<SearchResult> = results
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .collect();
        if !options.include_readme {
            for result in &mut page {
                result.plugin.readme = None;
            }
        }

        Ok(SearchResponse {
            query: raw_query.to_string(),
            results: page,
            total,
            filters: options.filters.clone(),
            sort: options.sort,
            order: options.order,
            limit: options.limit,
            offset: options.offset,
        })
    }

    /// Best-effort event capture; failures never surface to the caller.
    fn record_analytics(&self, query: &str, response: &SearchResponse, options: &SearchOptions) {
        let filters =
            serde_json::to_value(&options.filters).unwrap_or_else(|_| serde_json::json!({}));
        if let Err(e) = self.db.insert_search_event(
            query,
            &filters,
            response.total as i64,
            options.session_id.as_deref(),
            options.user_id.as_deref(),
        ) {
            tracing::warn!(error = %e, query, "Failed to record search event");
            return;
        }
        if response.total == 0 {
            if let Err(e) = self.db.upsert_search_gap(query) {
                tracing::warn!(error = %e, query, "Failed to record search gap");
            }
        }
    }
}

// ============================================
// Scoring helpers
// ============================================

/// Name-match boost: exact 1.0, prefix 0.7, substring 0.5; a description
/// mention is worth 0.3 when the name missed entirely; +0.2 for featured
/// plugins; capped at 1.0.
fn relevance_boost(plugin: &PluginRecord, raw_query: &str) -> f64 {
    if raw_query.is_empty() {
        return 0.0;
    }
    let name = plugin.name.to_lowercase();
    let description_hit = plugin
        .description
        .as_deref()
        .map(|d| d.to_lowercase().contains(raw_query))
        .unwrap_or(false);
    let mut boost: f64 = if name == raw_query {
        1.0
    } else if name.starts_with(raw_query) {
        0.7
    } else if name.contains(raw_query) {
        0.5
    } else if description_hit {
        0.3
    } else {
        0.0
    };
    if plugin.is_featured {
        boost += 0.2;
    }
    boost.min(1.0)
}

/// Which fields contain at least one query token, for UI highlighting.
fn matched_fields(plugin: &PluginRecord, tokens: &[String]) -> Vec<PluginField> {
    let contains_any =
        |text: &str| -> bool { tokens.iter().any(|t| text.to_lowercase().contains(t.as_str())) };

    let mut fields = Vec::new();
    if contains_any(&plugin.name) {
        fields.push(PluginField::Name);
    }
    if plugin.description.as_deref().map(contains_any).unwrap_or(false) {
        fields.push(PluginField::Description);
    }
    if plugin.keywords.as_deref().map(contains_any).unwrap_or(false) {
        fields.push(PluginField::Keywords);
    }
    if plugin.readme.as_deref().map(contains_any).unwrap_or(false) {
        fields.push(PluginField::Readme);
    }
    fields
}

/// Sort by the selected key; ties always fall back to downloads descending
/// then plugin id ascending so rankings are total and reproducible.
fn sort_results(results: &mut [SearchResult], sort: SortKey, order: SortOrder) {
    results.sort_by(|a, b| {
        let ascending = match sort {
            SortKey::Relevance => cmp_f64(a.score, b.score),
            SortKey::Downloads => a.plugin.downloads.cmp(&b.plugin.downloads),
            SortKey::Rating => cmp_f64(a.plugin.rating, b.plugin.rating),
            SortKey::Recent => recency_key(a).cmp(&recency_key(b)),
            SortKey::Name => a
                .plugin
                .name
                .to_lowercase()
                .cmp(&b.plugin.name.to_lowercase()),
        };
        let primary = match order {
            SortOrder::Asc => ascending,
            SortOrder::Desc => ascending.reverse(),
        };
        primary
            .then_with(|| b.plugin.downloads.cmp(&a.plugin.downloads))
            .then_with(|| a.plugin.id.cmp(&b.plugin.id))
    });
}

fn recency_key(result: &SearchResult) -> chrono::DateTime<Utc> {
    result
        .plugin
        .published_at
        .unwrap_or(result.plugin.updated_at)
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

// ============================================
// Match expressions
// ============================================

/// OR of quoted stems: `"auth" OR "agent"`.
fn exact_match_expr(stems: &[String]) -> String {
    unique(stems)
        .iter()
        .map(|s| format!("\"{}\"", s))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// OR of quoted stems and their prefix expansions:
/// `"kubernete" OR "kubernete"*`.
fn prefix_match_expr(stems: &[String]) -> String {
    unique(stems)
        .iter()
        .map(|s| format!("\"{0}\" OR \"{0}\"*", s))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn unique(stems: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    stems
        .iter()
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect()
}

fn validate_options(options: &SearchOptions) -> Result<()> {
    if options.limit == 0 {
        return Err(Error::Validation("limit must be at least 1".to_string()));
    }
    if let Some(rating) = options.filters.min_rating {
        if !(0.0..=5.0).contains(&rating) {
            return Err(Error::Validation(format!(
                "min rating {} outside [0, 5]",
                rating
            )));
        }
    }
    if let (Some(min), Some(max)) = (options.filters.min_downloads, options.filters.max_downloads)
    {
        if max < min {
            return Err(Error::Validation(
                "max downloads below min downloads".to_string(),
            ));
        }
    }
    Ok(())
}
