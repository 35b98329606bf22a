//! Recommendation engine: collaborative, content-based, trending, and the
//! blend that combines them
//!
//! Every public operation is cached in the store with a TTL keyed by a
//! SHA-256 hash of the kind and the canonical request context. Install and
//! uninstall recording invalidate the entries whose context references the
//! affected plugin. A failing sub-signal contributes an empty list; the call
//! only fails when every signal does.

use crate::config::CacheConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::*;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Minimum content similarity worth recommending.
const SIMILARITY_THRESHOLD: f64 = 0.1;
/// Content similarity blend: tags dominate keywords.
const TAG_WEIGHT: f64 = 0.6;
const KEYWORD_WEIGHT: f64 = 0.4;

/// Result of a recommendation operation plus cache provenance.
#[derive(Debug)]
pub struct RecommendOutcome {
    pub items: Vec<Recommendation>,
    /// True when the payload came from a live cache entry
    pub cached: bool,
}

/// Produces ranked plugin recommendations from the co-install graph,
/// content similarity, and install velocity.
pub struct RecommendationEngine {
    db: Arc<Database>,
    cache: CacheConfig,
}

impl RecommendationEngine {
    pub fn new(db: Arc<Database>, cache: CacheConfig) -> Self {
        Self { db, cache }
    }

    // ============================================
    // Public operations
    // ============================================

    /// Personalized blend: collaborative, then content-based, then trending,
    /// deduplicated by plugin keeping the first (strongest) occurrence.
    pub fn recommend(&self, context: &RecommendationContext) -> Result<RecommendOutcome> {
        if context.limit == 0 {
            return Err(Error::Validation("limit must be at least 1".to_string()));
        }

        let canonical = context.canonical();
        let key = cache_key("personalized", &canonical);
        if let Some(items) = self.cache_lookup(&key) {
            return Ok(RecommendOutcome {
                items,
                cached: true,
            });
        }

        let installed = context.sorted_installed();
        let mut failures = 0usize;
        let mut last_error: Option<Error> = None;
        let mut catch = |name: &str, result: Result<Vec<Recommendation>>| match result {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(signal = name, error = %e, "Recommendation signal failed");
                failures += 1;
                last_error = Some(e);
                Vec::new()
            }
        };

        let collaborative = catch(
            "collaborative",
            self.collaborative(&installed, context.limit),
        );
        let content = catch(
            "content_based",
            self.content_based(&installed, context.category, context.limit, true),
        );
        let trending = catch("trending", self.trending_items(TrendingPeriod::Week, context.limit));

        if failures == 3 {
            return Err(last_error.expect("three failures imply a last error"));
        }

        let installed_set: HashSet<&str> = installed.iter().map(String::as_str).collect();
        let mut seen: HashSet<String> = HashSet::new();
        let mut items = Vec::new();
        for rec in collaborative
            .into_iter()
            .chain(content)
            .chain(trending)
        {
            if context.exclude_installed && installed_set.contains(rec.plugin.id.as_str()) {
                continue;
            }
            if seen.insert(rec.plugin.id.clone()) {
                items.push(rec);
            }
        }
        items.truncate(context.limit);

        self.cache_store(
            &key,
            "personalized",
            &canonical,
            &installed,
            &items,
            self.cache.personalized_ttl_secs,
        );
        Ok(RecommendOutcome {
            items,
            cached: false,
        })
    }

    /// Content-based similarity with a single source plugin.
    pub fn similar(&self, plugin_id: &str, limit: usize) -> Result<RecommendOutcome> {
        if limit == 0 {
            return Err(Error::Validation("limit must be at least 1".to_string()));
        }
        if !self.db.plugin_exists(plugin_id)? {
            return Err(Error::PluginNotFound(plugin_id.to_string()));
        }

        let canonical = format!("plugin={};limit={}", plugin_id, limit);
        let key = cache_key("similar", &canonical);
        if let Some(items) = self.cache_lookup(&key) {
            return Ok(RecommendOutcome {
                items,
                cached: true,
            });
        }

        let sources = vec![plugin_id.to_string()];
        let items = self.content_based(&sources, None, limit, false)?;
        self.cache_store(
            &key,
            "similar",
            &canonical,
            &sources,
            &items,
            self.cache.similar_ttl_secs,
        );
        Ok(RecommendOutcome {
            items,
            cached: false,
        })
    }

    /// Plugins ranked by install velocity; the period picks which window
    /// count the reason surfaces.
    pub fn trending(&self, period: TrendingPeriod, limit: usize) -> Result<RecommendOutcome> {
        if limit == 0 {
            return Err(Error::Validation("limit must be at least 1".to_string()));
        }

        let canonical = format!("period={};limit={}", period.as_str(), limit);
        let key = cache_key("trending", &canonical);
        if let Some(items) = self.cache_lookup(&key) {
            return Ok(RecommendOutcome {
                items,
                cached: true,
            });
        }

        let items = self.trending_items(period, limit)?;
        self.cache_store(
            &key,
            "trending",
            &canonical,
            &[],
            &items,
            self.cache.trending_ttl_secs,
        );
        Ok(RecommendOutcome {
            items,
            cached: false,
        })
    }

    /// Record an install and expire every cache entry referencing the plugin.
    pub fn record_install(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        version: Option<&str>,
        source: Option<&str>,
    ) -> Result<()> {
        self.db.record_install(plugin_id, user_id, version, source)?;
        self.invalidate(plugin_id);
        Ok(())
    }

    /// Record an uninstall and expire every cache entry referencing the
    /// plugin. Returns false when there was no open install to close.
    pub fn record_uninstall(&self, plugin_id: &str, user_id: Option<&str>) -> Result<bool> {
        let closed = self.db.record_uninstall(plugin_id, user_id)?;
        self.invalidate(plugin_id);
        Ok(closed)
    }

    // ============================================
    // Signals
    // ============================================

    /// Collaborative filtering over the co-install graph: each candidate is
    /// scored by the summed confidence of its edges into the installed set,
    /// ties broken by how many installed plugins drove it.
    fn collaborative(&self, installed: &[String], limit: usize) -> Result<Vec<Recommendation>> {
        if installed.is_empty() {
            return Ok(Vec::new());
        }
        let installed_set: HashSet<&str> = installed.iter().map(String::as_str).collect();
        let relationships = self.db.relationships_for(installed)?;

        struct Accumulator {
            score: f64,
            matches: i64,
            drivers: Vec<(String, f64)>,
        }

        let mut by_candidate: BTreeMap<String, Accumulator> = BTreeMap::new();
        for rel in relationships {
            let (driver, candidate) = if installed_set.contains(rel.plugin_a.as_str())
                && !installed_set.contains(rel.plugin_b.as_str())
            {
                (rel.plugin_a, rel.plugin_b)
            } else if installed_set.contains(rel.plugin_b.as_str())
                && !installed_set.contains(rel.plugin_a.as_str())
            {
                (rel.plugin_b, rel.plugin_a)
            } else {
                continue;
            };
            let acc = by_candidate.entry(candidate).or_insert(Accumulator {
                score: 0.0,
                matches: 0,
                drivers: Vec::new(),
            });
            acc.score += rel.confidence;
            acc.matches += 1;
            acc.drivers.push((driver, rel.confidence));
        }

        if by_candidate.is_empty() {
            return Ok(Vec::new());
        }

        let candidate_ids: Vec<String> = by_candidate.keys().cloned().collect();
        let plugins: HashMap<String, PluginRecord> = self
            .db
            .get_plugins(&candidate_ids)?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let driver_names: HashMap<String, String> = self
            .db
            .get_plugins(installed)?
            .into_iter()
            .map(|p| (p.id.clone(), p.name))
            .collect();

        let mut items: Vec<(Recommendation, i64)> = Vec::new();
        for (candidate_id, mut acc) in by_candidate {
            let Some(plugin) = plugins.get(&candidate_id) else {
                continue;
            };
            if plugin.is_deprecated {
                continue;
            }
            acc.drivers
                .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let names: Vec<&str> = acc
                .drivers
                .iter()
                .take(2)
                .map(|(id, _)| driver_names.get(id).map(String::as_str).unwrap_or(id))
                .collect();
            let reason = match names.as_slice() {
                [one] => format!("Frequently installed together with {}", one),
                [one, two] => format!("Frequently installed together with {} and {}", one, two),
                _ => "Frequently installed together with your plugins".to_string(),
            };
            items.push((
                Recommendation {
                    plugin: plugin.clone(),
                    score: acc.score,
                    reason,
                    kind: RecommendationKind::Collaborative,
                },
                acc.matches,
            ));
        }

        items.sort_by(|(a, a_matches), (b, b_matches)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b_matches.cmp(a_matches))
                .then_with(|| b.plugin.downloads.cmp(&a.plugin.downloads))
                .then_with(|| a.plugin.id.cmp(&b.plugin.id))
        });
        Ok(items.into_iter().take(limit).map(|(rec, _)| rec).collect())
    }

    /// Content-based similarity: Jaccard over tag sets and keyword sets,
    /// blended 0.6/0.4, deduplicated keeping the best source. When the
    /// sources are empty or the list runs short, `top_up` fills from the
    /// most popular plugins of the requested category.
    fn content_based(
        &self,
        installed: &[String],
        category: Option<Category>,
        limit: usize,
        top_up: bool,
    ) -> Result<Vec<Recommendation>> {
        let installed_set: HashSet<&str> = installed.iter().map(String::as_str).collect();
        // unknown ids drop out here
        let sources = self.db.get_plugins(installed)?;

        let mut best: BTreeMap<String, (f64, String)> = BTreeMap::new();
        if !sources.is_empty() {
            let candidates = self.db.active_plugins()?;
            for source in &sources {
                let source_tags = tag_set(source);
                let source_keywords = keyword_set(source);
                for candidate in &candidates {
                    if installed_set.contains(candidate.id.as_str()) {
                        continue;
                    }
                    let similarity = TAG_WEIGHT * jaccard(&source_tags, &tag_set(candidate))
                        + KEYWORD_WEIGHT
                            * jaccard(&source_keywords, &keyword_set(candidate));
                    if similarity < SIMILARITY_THRESHOLD {
                        continue;
                    }
                    let entry = best
                        .entry(candidate.id.clone())
                        .or_insert((0.0, source.name.clone()));
                    if similarity > entry.0 {
                        *entry = (similarity, source.name.clone());
                    }
                }
            }
        }

        let candidate_ids: Vec<String> = best.keys().cloned().collect();
        let plugins: HashMap<String, PluginRecord> = self
            .db
            .get_plugins(&candidate_ids)?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let mut items: Vec<Recommendation> = best
            .into_iter()
            .filter_map(|(id, (score, source_name))| {
                plugins.get(&id).map(|plugin| Recommendation {
                    plugin: plugin.clone(),
                    score,
                    reason: format!("Similar tags and keywords to {}", source_name),
                    kind: RecommendationKind::ContentBased,
                })
            })
            .collect();
        items.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.plugin.downloads.cmp(&a.plugin.downloads))
                .then_with(|| a.plugin.id.cmp(&b.plugin.id))
        });
        items.truncate(limit);

        if top_up && items.len() < limit {
            if let Some(category) = category {
                let seen: HashSet<String> =
                    items.iter().map(|r| r.plugin.id.clone()).collect();
                for plugin in self.db.popular_in_category(category, limit)? {
                    if items.len() >= limit {
                        break;
                    }
                    if installed_set.contains(plugin.id.as_str())
                        || seen.contains(&plugin.id)
                    {
                        continue;
                    }
                    items.push(Recommendation {
                        score: plugin.rating / 5.0,
                        reason: format!("Popular in {}", category.display_name()),
                        kind: RecommendationKind::Popular,
                        plugin,
                    });
                }
            }
        }

        Ok(items)
    }

    fn trending_items(&self, period: TrendingPeriod, limit: usize) -> Result<Vec<Recommendation>> {
        let rows = self.db.top_trending(limit)?;
        Ok(rows
            .into_iter()
            .map(|(trend, plugin)| {
                let (count, label) = match period {
                    TrendingPeriod::Day => (trend.installs_day, "24 hours"),
                    TrendingPeriod::Week => (trend.installs_week, "week"),
                    TrendingPeriod::Month => (trend.installs_month, "month"),
                };
                Recommendation {
                    plugin,
                    score: trend.velocity_score,
                    reason: format!("{} installs in the last {}", count, label),
                    kind: RecommendationKind::Trending,
                }
            })
            .collect())
    }

    // ============================================
    // Cache plumbing
    // ============================================

    /// Cache reads are best-effort; a read failure is a miss, not an error.
    fn cache_lookup(&self, key: &str) -> Option<Vec<Recommendation>> {
        match self.db.cache_get(key) {
            Ok(Some(payload)) => match serde_json::from_str(&payload) {
                Ok(items) => Some(items),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Cache read failed");
                None
            }
        }
    }

    /// Cache writes are best-effort; the fresh result is returned regardless.
    fn cache_store(
        &self,
        key: &str,
        kind: &str,
        context: &str,
        context_plugins: &[String],
        items: &[Recommendation],
        ttl_secs: i64,
    ) {
        let payload = match serde_json::to_string(items) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize cache payload");
                return;
            }
        };
        if let Err(e) =
            self.db
                .cache_put(key, kind, context, context_plugins, &payload, ttl_secs)
        {
            tracing::warn!(error = %e, kind, "Cache write failed");
        }
    }

    fn invalidate(&self, plugin_id: &str) {
        match self.db.invalidate_cache_for_plugin(plugin_id) {
            Ok(expired) if expired > 0 => {
                tracing::debug!(plugin_id, expired, "Invalidated cached recommendations");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, plugin_id, "Cache invalidation failed");
            }
        }
    }
}

/// SHA-256 over `kind ∥ canonical context`, hex-encoded.
fn cache_key(kind: &str, canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn tag_set(plugin: &PluginRecord) -> HashSet<String> {
    plugin.tags.iter().map(|t| t.to_lowercase()).collect()
}

fn keyword_set(plugin: &PluginRecord) -> HashSet<String> {
    plugin
        .keywords
        .as_deref()
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_lowercase)
        .collect()
}

/// `|A ∩ B| / |A ∪ B|`; zero when both sets are empty.
fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = (a.len() + b.len()) as f64 - intersection;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, TrendingConfig};
    use crate::indexer::Indexer;
    use crate::text::Normalizer;

    struct Fixture {
        db: Arc<Database>,
        indexer: Indexer,
        engine: RecommendationEngine,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let indexer = Indexer::new(db.clone(), Normalizer::default(), TrendingConfig::default());
        let engine = RecommendationEngine::new(db.clone(), CacheConfig::default());
        Fixture {
            db,
            indexer,
            engine,
        }
    }

    fn plugin(id: &str, name: &str) -> PluginRecord {
        PluginRecord::new(id, name, Category::Agents)
    }

    #[test]
    fn test_collaborative_scenario() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            f.indexer.index_plugin(&plugin(id, id)).unwrap();
        }
        // U1: {A,B}  U2: {A,B,C}  U3: {A,C}
        for (user, plugins) in [
            ("u1", vec!["a", "b"]),
            ("u2", vec!["a", "b", "c"]),
            ("u3", vec!["a", "c"]),
        ] {
            for p in plugins {
                f.db.record_install(p, Some(user), None, None).unwrap();
            }
        }
        f.indexer.update_relationships().unwrap();

        let context = RecommendationContext {
            installed_plugins: vec!["a".to_string()],
            ..Default::default()
        };
        let outcome = f.engine.recommend(&context).unwrap();
        let ids: Vec<&str> = outcome.items.iter().map(|r| r.plugin.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"b") && ids.contains(&"c"));
        assert!(!ids.contains(&"a"));
        // confidence(a,b) = confidence(a,c) = 2/3
        assert!((outcome.items[0].score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(outcome.items[0].kind, RecommendationKind::Collaborative);
        assert!(outcome.items[0].reason.contains("installed together"));
    }

    #[test]
    fn test_content_similarity_and_threshold() {
        let f = fixture();
        let mut source = plugin("p1", "auth-agent");
        source.tags = vec!["auth".to_string(), "security".to_string()];
        source.keywords = Some("oauth tokens".to_string());
        let mut close = plugin("p2", "auth-middleware");
        close.tags = vec!["auth".to_string(), "security".to_string()];
        close.keywords = Some("oauth sessions".to_string());
        let mut far = plugin("p3", "image-resizer");
        far.tags = vec!["images".to_string()];
        far.keywords = Some("png jpeg".to_string());
        for p in [&source, &close, &far] {
            f.indexer.index_plugin(p).unwrap();
        }

        let outcome = f.engine.similar("p1", 10).unwrap();
        let ids: Vec<&str> = outcome.items.iter().map(|r| r.plugin.id.as_str()).collect();
        assert_eq!(ids, vec!["p2"]);
        // tags identical (1.0), keywords share 1 of 3
        let expected = 0.6 * 1.0 + 0.4 * (1.0 / 3.0);
        assert!((outcome.items[0].score - expected).abs() < 1e-9);
        assert_eq!(outcome.items[0].kind, RecommendationKind::ContentBased);
    }

    #[test]
    fn test_similar_unknown_plugin_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.engine.similar("ghost", 5),
            Err(Error::PluginNotFound(_))
        ));
    }

    #[test]
    fn test_deprecated_excluded_everywhere() {
        let f = fixture();
        let mut live = plugin("live", "live");
        live.tags = vec!["auth".to_string()];
        let mut dead = plugin("dead", "dead");
        dead.tags = vec!["auth".to_string()];
        dead.is_deprecated = true;
        let mut source = plugin("src", "src");
        source.tags = vec!["auth".to_string()];
        for p in [&live, &dead, &source] {
            f.indexer.index_plugin(p).unwrap();
        }
        for user in ["u1", "u2"] {
            f.db.record_install("src", Some(user), None, None).unwrap();
            f.db.record_install("dead", Some(user), None, None).unwrap();
            f.db.record_install("live", Some(user), None, None).unwrap();
        }
        f.indexer.update_relationships().unwrap();
        f.indexer.update_trending().unwrap();

        let context = RecommendationContext {
            installed_plugins: vec!["src".to_string()],
            ..Default::default()
        };
        let outcome = f.engine.recommend(&context).unwrap();
        assert!(outcome.items.iter().all(|r| r.plugin.id != "dead"));

        let outcome = f.engine.trending(TrendingPeriod::Week, 10).unwrap();
        assert!(outcome.items.iter().all(|r| r.plugin.id != "dead"));

        let outcome = f.engine.similar("src", 10).unwrap();
        assert!(outcome.items.iter().all(|r| r.plugin.id != "dead"));
    }

    #[test]
    fn test_empty_installed_set_falls_back_to_trending_and_category() {
        let f = fixture();
        let mut popular = plugin("pop", "popular-agent");
        popular.downloads = 1000;
        popular.rating = 4.5;
        f.indexer.index_plugin(&popular).unwrap();
        f.db.record_install("pop", Some("u1"), None, None).unwrap();
        f.indexer.update_trending().unwrap();

        let context = RecommendationContext {
            installed_plugins: vec![],
            category: Some(Category::Agents),
            ..Default::default()
        };
        let outcome = f.engine.recommend(&context).unwrap();
        assert!(!outcome.items.is_empty());
        // category top-up arrives before the trending tail and wins the dedupe
        assert_eq!(outcome.items[0].kind, RecommendationKind::Popular);
    }

    #[test]
    fn test_cache_hit_returns_equal_payload() {
        let f = fixture();
        let mut a = plugin("a", "a");
        a.tags = vec!["auth".to_string()];
        let mut b = plugin("b", "b");
        b.tags = vec!["auth".to_string()];
        f.indexer.index_plugin(&a).unwrap();
        f.indexer.index_plugin(&b).unwrap();

        let context = RecommendationContext {
            installed_plugins: vec!["a".to_string()],
            ..Default::default()
        };
        let fresh = f.engine.recommend(&context).unwrap();
        assert!(!fresh.cached);

        let cached = f.engine.recommend(&context).unwrap();
        assert!(cached.cached);
        let fresh_ids: Vec<_> = fresh.items.iter().map(|r| (r.plugin.id.clone(), r.score)).collect();
        let cached_ids: Vec<_> = cached.items.iter().map(|r| (r.plugin.id.clone(), r.score)).collect();
        assert_eq!(fresh_ids, cached_ids);
    }

    #[test]
    fn test_install_invalidates_matching_context() {
        let f = fixture();
        let mut a = plugin("a", "a");
        a.tags = vec!["auth".to_string()];
        let mut b = plugin("b", "b");
        b.tags = vec!["auth".to_string()];
        f.indexer.index_plugin(&a).unwrap();
        f.indexer.index_plugin(&b).unwrap();

        let context = RecommendationContext {
            installed_plugins: vec!["a".to_string()],
            ..Default::default()
        };
        f.engine.recommend(&context).unwrap();
        assert!(f.engine.recommend(&context).unwrap().cached);

        // installing a plugin named in the context expires the entry
        f.engine.record_install("a", Some("u1"), None, None).unwrap();
        assert!(!f.engine.recommend(&context).unwrap().cached);
    }

    #[test]
    fn test_uninstall_without_open_event() {
        let f = fixture();
        f.indexer.index_plugin(&plugin("a", "a")).unwrap();
        assert!(!f.engine.record_uninstall("a", Some("u1")).unwrap());
    }

    #[test]
    fn test_jaccard_edge_cases() {
        let empty: HashSet<String> = HashSet::new();
        let some: HashSet<String> = ["x".to_string()].into_iter().collect();
        assert_eq!(jaccard(&empty, &empty), 0.0);
        assert_eq!(jaccard(&some, &empty), 0.0);
        assert_eq!(jaccard(&some, &some), 1.0);
    }
}
