//! Indexing layer: manifest ingest and derived-table maintenance
//!
//! The indexer is the only writer of plugin records, term postings, document
//! frequencies, co-install relationships, and trending scores. Each
//! maintenance pass rewrites its table in a single transaction, so readers
//! see either the previous index or the new one, never a mix.
//!
//! ```text
//! ┌──────────────┐     ┌─────────────┐     ┌──────────────────────────┐
//! │ Manifest     │ ──► │   Indexer   │ ──► │         Database         │
//! │ records      │     │             │     │ plugins / postings / ... │
//! └──────────────┘     └─────────────┘     └──────────────────────────┘
//!                            │
//!                            ▼
//!                  ┌──────────────────┐
//!                  │    Normalizer    │
//!                  │ tokenize + stem  │
//!                  └──────────────────┘
//! ```

use crate::config::TrendingConfig;
use crate::db::{Database, InstallCounts};
use crate::error::{Error, Result};
use crate::text::{self, Normalizer};
use crate::types::*;
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Pairs seen by fewer users than this are dropped from the co-install
/// graph; they carry no signal and would blow up its cardinality.
const MIN_CO_INSTALL_COUNT: i64 = 2;

/// Ingests plugin manifests and maintains the derived index tables.
pub struct Indexer {
    db: Arc<Database>,
    normalizer: Normalizer,
    trending: TrendingConfig,
}

impl Indexer {
    pub fn new(db: Arc<Database>, normalizer: Normalizer, trending: TrendingConfig) -> Self {
        Self {
            db,
            normalizer,
            trending,
        }
    }

    // ============================================
    // Ingest
    // ============================================

    /// Upsert one plugin and queue it for the next TF-IDF refresh.
    ///
    /// `downloads`, `rating`, `rating_count`, and `created_at` survive
    /// re-ingest of an existing id; everything else follows the manifest.
    pub fn index_plugin(&self, record: &PluginRecord) -> Result<()> {
        let record = normalize_record(record)?;
        self.db.upsert_plugin(&record)?;
        self.db.enqueue_reindex(&record.id)?;
        tracing::debug!(plugin_id = %record.id, "Indexed plugin");
        Ok(())
    }

    /// Bulk ingest. The upsert pass runs in one transaction; records that
    /// fail validation are reported in the result and do not abort the rest.
    pub fn build_index(&self, records: &[PluginRecord], options: &BuildOptions) -> Result<BuildReport> {
        let mut report = BuildReport::default();
        let mut valid: Vec<PluginRecord> = Vec::with_capacity(records.len());
        let mut seen_ids: HashSet<String> = HashSet::with_capacity(records.len());

        for record in records {
            match normalize_record(record) {
                Ok(normalized) => {
                    if !seen_ids.insert(normalized.id.clone()) {
                        report.skipped += 1;
                        continue;
                    }
                    valid.push(normalized);
                }
                Err(e) => {
                    report.failed += 1;
                    report.errors.push((record.id.clone(), e.to_string()));
                }
            }
        }

        self.db.upsert_plugins(&valid)?;
        report.indexed = valid.len();

        if !options.rebuild {
            for record in &valid {
                self.db.enqueue_reindex(&record.id)?;
            }
        }

        if options.compute_tfidf {
            if options.rebuild {
                self.update_tfidf()?;
            } else {
                self.update_tfidf_incremental()?;
            }
        }
        if options.update_relationships {
            self.update_relationships()?;
        }
        if options.update_trending {
            self.update_trending()?;
        }

        tracing::info!(
            indexed = report.indexed,
            skipped = report.skipped,
            failed = report.failed,
            rebuild = options.rebuild,
            "Bulk ingest complete"
        );
        Ok(report)
    }

    // ============================================
    // TF-IDF
    // ============================================

    /// Full TF-IDF refresh over the whole corpus; one transaction.
    pub fn update_tfidf(&self) -> Result<usize> {
        let plugins = self.db.all_plugins()?;
        let mut postings = Vec::new();
        for plugin in &plugins {
            self.collect_postings(plugin, &mut postings);
        }
        let written =
            self.db
                .rebuild_postings(None, &postings, &text::stopword_fingerprint())?;
        tracing::info!(plugins = plugins.len(), postings = written, "TF-IDF refresh complete");
        Ok(written)
    }

    /// Incremental refresh: recompute postings for queued plugins only, then
    /// rebuild document frequencies (and every posting's idf) globally.
    pub fn update_tfidf_incremental(&self) -> Result<usize> {
        let queued = self.db.queued_plugin_ids()?;
        if queued.is_empty() {
            return Ok(0);
        }
        let plugins = self.db.get_plugins(&queued)?;
        let mut postings = Vec::new();
        for plugin in &plugins {
            self.collect_postings(plugin, &mut postings);
        }
        let written =
            self.db
                .rebuild_postings(Some(&queued), &postings, &text::stopword_fingerprint())?;
        tracing::info!(
            plugins = plugins.len(),
            postings = written,
            "Incremental TF-IDF refresh complete"
        );
        Ok(written)
    }

    /// Tokenize each field and emit `tf = count / max(1, field_len)` rows.
    /// Field-length normalization keeps README bulk from dominating.
    fn collect_postings(&self, plugin: &PluginRecord, out: &mut Vec<TermPosting>) {
        let fields: [(PluginField, String); 5] = [
            (PluginField::Name, plugin.name.clone()),
            (
                PluginField::Description,
                plugin.description.clone().unwrap_or_default(),
            ),
            (
                PluginField::Keywords,
                plugin.keywords.clone().unwrap_or_default(),
            ),
            (PluginField::Readme, plugin.readme.clone().unwrap_or_default()),
            (PluginField::Tags, plugin.tags.join(" ")),
        ];

        for (field, content) in fields {
            let normalized = self.normalizer.normalize(&content);
            if normalized.stems.is_empty() {
                continue;
            }
            let field_len = normalized.stems.len() as f64;
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for stem in &normalized.stems {
                *counts.entry(stem.as_str()).or_insert(0) += 1;
            }
            for (term, count) in counts {
                out.push(TermPosting {
                    term: term.to_string(),
                    plugin_id: plugin.id.clone(),
                    field,
                    term_frequency: count as f64 / field_len,
                    inverse_document_frequency: 0.0,
                    tfidf_score: 0.0,
                });
            }
        }
    }

    // ============================================
    // Co-install relationships
    // ============================================

    /// Rebuild the co-install graph from active memberships; one transaction.
    ///
    /// `confidence(a, b)` is the Jaccard index over the two plugins' active
    /// user sets. Pairs below the co-install floor are dropped.
    pub fn update_relationships(&self) -> Result<usize> {
        let memberships = self.db.active_memberships()?;

        let mut user_plugins: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut plugin_users: HashMap<String, HashSet<String>> = HashMap::new();
        for (user, plugin) in memberships {
            user_plugins
                .entry(user.clone())
                .or_default()
                .insert(plugin.clone());
            plugin_users.entry(plugin).or_default().insert(user);
        }

        let mut pair_counts: BTreeMap<(String, String), i64> = BTreeMap::new();
        for plugins in user_plugins.values() {
            let list: Vec<&String> = plugins.iter().collect();
            for i in 0..list.len() {
                for j in (i + 1)..list.len() {
                    // BTreeSet iteration is sorted, so (i, j) is canonical
                    let key = (list[i].clone(), list[j].clone());
                    *pair_counts.entry(key).or_insert(0) += 1;
                }
            }
        }

        let mut relationships = Vec::new();
        for ((a, b), count) in pair_counts {
            if count < MIN_CO_INSTALL_COUNT {
                continue;
            }
            let users_a = plugin_users.get(&a).map(|s| s.len() as i64).unwrap_or(0);
            let users_b = plugin_users.get(&b).map(|s| s.len() as i64).unwrap_or(0);
            let union = users_a + users_b - count;
            let confidence = if union > 0 {
                count as f64 / union as f64
            } else {
                0.0
            };
            relationships.push(PluginRelationship {
                plugin_a: a,
                plugin_b: b,
                co_install_count: count,
                confidence,
            });
        }

        let written = self.db.replace_relationships(&relationships)?;
        tracing::info!(relationships = written, "Co-install graph rebuilt");
        Ok(written)
    }

    // ============================================
    // Trending
    // ============================================

    /// Refresh per-plugin install velocity over the trailing 24h/7d/30d
    /// windows; one transaction.
    pub fn update_trending(&self) -> Result<usize> {
        let now = Utc::now();
        let counts = self.db.install_counts_since(
            now - Duration::hours(24),
            now - Duration::days(7),
            now - Duration::days(30),
        )?;

        let records: Vec<TrendingRecord> = counts
            .iter()
            .map(|c: &InstallCounts| TrendingRecord {
                plugin_id: c.plugin_id.clone(),
                installs_day: c.day,
                installs_week: c.week,
                installs_month: c.month,
                velocity_score: self.trending.day_weight * c.day as f64
                    + self.trending.week_weight * c.week as f64
                    + self.trending.month_weight * c.month as f64,
                computed_at: now,
            })
            .collect();

        let written = self.db.replace_trending(&records)?;
        tracing::info!(plugins = written, "Trending scores refreshed");
        Ok(written)
    }

    // ============================================
    // Maintenance
    // ============================================

    /// Ask the store to reclaim space and refresh statistics. Idempotent.
    pub fn optimize(&self) -> Result<()> {
        self.db.optimize()?;
        tracing::info!("Index optimized");
        Ok(())
    }

    /// Index health snapshot.
    pub fn index_stats(&self) -> Result<IndexStats> {
        self.db.index_stats()
    }

    /// True when the postings were built with a different stop-word list
    /// than the one compiled in.
    pub fn needs_reindex(&self) -> Result<bool> {
        let stored = self.db.get_index_meta(crate::db::repo::META_STOPWORD_FINGERPRINT)?;
        Ok(match stored {
            Some(fp) => fp != text::stopword_fingerprint(),
            None => false,
        })
    }
}

/// Trim strings, canonicalize tags, and reject malformed records.
fn normalize_record(record: &PluginRecord) -> Result<PluginRecord> {
    let id = record.id.trim().to_string();
    if id.is_empty() {
        return Err(Error::Indexing {
            plugin_id: record.id.clone(),
            message: "plugin id must not be empty".to_string(),
        });
    }
    let name = record.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::Indexing {
            plugin_id: id,
            message: "plugin name must not be empty".to_string(),
        });
    }
    if !(0.0..=5.0).contains(&record.rating) {
        return Err(Error::Indexing {
            plugin_id: id,
            message: format!("rating {} outside [0, 5]", record.rating),
        });
    }
    if record.downloads < 0 || record.rating_count < 0 {
        return Err(Error::Indexing {
            plugin_id: id,
            message: "counters must be nonnegative".to_string(),
        });
    }

    let mut tags: Vec<String> = record
        .tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();

    let mut normalized = record.clone();
    normalized.id = id;
    normalized.name = name;
    normalized.description = trim_opt(&record.description);
    normalized.keywords = trim_opt(&record.keywords);
    normalized.author_name = trim_opt(&record.author_name);
    normalized.tags = tags;
    normalized.updated_at = Utc::now();
    Ok(normalized)
}

fn trim_opt(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_indexer() -> Indexer {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        Indexer::new(db, Normalizer::default(), TrendingConfig::default())
    }

    fn plugin(id: &str, name: &str, description: &str) -> PluginRecord {
        let mut p = PluginRecord::new(id, name, Category::Agents);
        p.description = Some(description.to_string());
        p
    }

    #[test]
    fn test_index_plugin_normalizes_and_queues() {
        let indexer = test_indexer();
        let mut record = plugin("  p1  ", "  auth-agent ", "authentication helper");
        record.tags = vec!["  Security ".to_string(), "auth".to_string(), "security".to_string()];
        indexer.index_plugin(&record).unwrap();

        let stored = indexer.db.get_plugin("p1").unwrap().unwrap();
        assert_eq!(stored.name, "auth-agent");
        assert_eq!(stored.tags, vec!["auth".to_string(), "security".to_string()]);
        assert_eq!(indexer.db.queued_plugin_ids().unwrap(), vec!["p1".to_string()]);
    }

    #[test]
    fn test_index_plugin_rejects_bad_rating() {
        let indexer = test_indexer();
        let mut record = plugin("p1", "auth-agent", "helper");
        record.rating = 6.5;
        assert!(matches!(
            indexer.index_plugin(&record),
            Err(Error::Indexing { .. })
        ));
    }

    #[test]
    fn test_build_index_reports_per_record_errors() {
        let indexer = test_indexer();
        let good = plugin("p1", "auth-agent", "authentication");
        let mut bad = plugin("p2", "broken", "broken");
        bad.rating = -1.0;
        let duplicate = plugin("p1", "auth-agent", "authentication");

        let report = indexer
            .build_index(
                &[good, bad, duplicate],
                &BuildOptions {
                    compute_tfidf: false,
                    update_relationships: false,
                    update_trending: false,
                    rebuild: false,
                },
            )
            .unwrap();

        assert_eq!(report.indexed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "p2");
    }

    #[test]
    fn test_tfidf_refresh_invariants() {
        let indexer = test_indexer();
        indexer
            .index_plugin(&plugin("p1", "auth-agent", "authentication helper"))
            .unwrap();
        indexer
            .index_plugin(&plugin("p2", "auth-middleware", "authentication middleware"))
            .unwrap();
        indexer.index_plugin(&plugin("p3", "logger", "logging")).unwrap();

        indexer.update_tfidf().unwrap();

        // df("authentication") = 2 of 3 docs
        let df = indexer.db.document_frequency("authentication").unwrap().unwrap();
        assert_eq!(df.document_count, 2);
        assert_eq!(df.total_documents, 3);

        // tfidf = tf * idf on every posting
        for id in ["p1", "p2", "p3"] {
            for posting in indexer.db.postings_for_plugin(id).unwrap() {
                assert!(
                    (posting.tfidf_score
                        - posting.term_frequency * posting.inverse_document_frequency)
                        .abs()
                        < 1e-9,
                    "posting {:?} violates tfidf = tf * idf",
                    posting
                );
            }
        }

        // refresh is idempotent
        let p1_before = indexer.db.postings_for_plugin("p1").unwrap();
        indexer.update_tfidf().unwrap();
        assert_eq!(p1_before, indexer.db.postings_for_plugin("p1").unwrap());
    }

    #[test]
    fn test_incremental_refresh_only_touches_queue() {
        let indexer = test_indexer();
        indexer
            .index_plugin(&plugin("p1", "auth-agent", "authentication"))
            .unwrap();
        indexer.update_tfidf().unwrap();
        assert!(indexer.db.queued_plugin_ids().unwrap().is_empty());

        // nothing queued, nothing to do
        assert_eq!(indexer.update_tfidf_incremental().unwrap(), 0);

        indexer.index_plugin(&plugin("p2", "logger", "logging")).unwrap();
        let written = indexer.update_tfidf_incremental().unwrap();
        assert!(written > 0);
        assert!(indexer.db.queued_plugin_ids().unwrap().is_empty());
        assert!(!indexer.db.postings_for_plugin("p2").unwrap().is_empty());
    }

    #[test]
    fn test_relationship_rebuild_confidence() {
        let indexer = test_indexer();
        for id in ["a", "b", "c"] {
            indexer.index_plugin(&plugin(id, id, "plugin")).unwrap();
        }
        // U1: {A,B}  U2: {A,B,C}  U3: {A,C}
        for (user, plugins) in [("u1", vec!["a", "b"]), ("u2", vec!["a", "b", "c"]), ("u3", vec!["a", "c"])] {
            for p in plugins {
                indexer.db.record_install(p, Some(user), None, None).unwrap();
            }
        }

        indexer.update_relationships().unwrap();

        let ab = indexer.db.get_relationship("a", "b").unwrap().unwrap();
        assert_eq!(ab.co_install_count, 2);
        assert!((ab.confidence - 2.0 / 3.0).abs() < 1e-9);

        let ac = indexer.db.get_relationship("a", "c").unwrap().unwrap();
        assert!((ac.confidence - 2.0 / 3.0).abs() < 1e-9);

        // B,C co-installed by one user only: below the floor, dropped
        assert!(indexer.db.get_relationship("b", "c").unwrap().is_none());

        // rebuild is idempotent
        indexer.update_relationships().unwrap();
        let ab2 = indexer.db.get_relationship("a", "b").unwrap().unwrap();
        assert_eq!(ab.co_install_count, ab2.co_install_count);
    }

    #[test]
    fn test_trending_velocity_weights() {
        let indexer = test_indexer();
        indexer.index_plugin(&plugin("p1", "hot", "fresh")).unwrap();
        indexer.db.record_install("p1", Some("u1"), None, None).unwrap();
        indexer.db.record_install("p1", Some("u2"), None, None).unwrap();

        indexer.update_trending().unwrap();

        let rows = indexer.db.top_trending(10).unwrap();
        assert_eq!(rows.len(), 1);
        let (trend, _) = &rows[0];
        assert_eq!(trend.installs_day, 2);
        // both installs land in all three windows: 2*(10 + 3 + 1)
        assert!((trend.velocity_score - 28.0).abs() < 1e-9);
    }

    #[test]
    fn test_needs_reindex_tracks_fingerprint() {
        let indexer = test_indexer();
        assert!(!indexer.needs_reindex().unwrap());

        indexer.index_plugin(&plugin("p1", "a", "b")).unwrap();
        indexer.update_tfidf().unwrap();
        assert!(!indexer.needs_reindex().unwrap());
    }
}
