//! Analytics collector: on-demand aggregates over the recorded event streams
//!
//! The search and recommendation engines write the raw events; this module
//! owns the summary queries that feed ranking reviews and gap curation.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{GapStatus, SearchGap};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A frequently-issued query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopQuery {
    pub query: String,
    pub count: i64,
}

/// Click-through for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCtr {
    pub query: String,
    pub searches: i64,
    pub clicks: i64,
    pub ctr: f64,
}

/// Click-through overall and per query with enough volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtrSummary {
    pub total_searches: i64,
    pub total_clicks: i64,
    pub overall_ctr: f64,
    pub per_query: Vec<QueryCtr>,
}

/// A query growing week over week.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendingQuery {
    pub query: String,
    pub this_week: i64,
    pub last_week: i64,
    /// `this_week / last_week`; only rows with both weeks positive qualify
    pub growth: f64,
}

/// Search → results → click → install, with the derived rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionFunnel {
    pub searches: i64,
    pub with_results: i64,
    pub clicked: i64,
    /// Installs attributed to search within the window
    pub installed: i64,
    pub click_through_rate: f64,
    pub conversion_rate: f64,
}

/// Clicks at one result position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClicks {
    pub position: i64,
    pub clicks: i64,
}

/// One user's search/click/install volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserActivity {
    pub user_id: String,
    pub searches: i64,
    pub clicks: i64,
    pub installs: i64,
}

/// Install volume for one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryInstalls {
    pub category: String,
    pub installs: i64,
}

/// The full on-demand bundle returned by `get_analytics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub days_back: i64,
    pub top_queries: Vec<TopQuery>,
    pub search_gaps: Vec<SearchGap>,
    pub ctr: CtrSummary,
    pub trending_queries: Vec<TrendingQuery>,
    pub funnel: ConversionFunnel,
    pub position_clicks: Vec<PositionClicks>,
    pub user_activity: Vec<UserActivity>,
    pub popular_categories: Vec<CategoryInstalls>,
}

const TOP_QUERY_LIMIT: usize = 20;
const USER_ACTIVITY_LIMIT: usize = 20;
const CTR_MIN_SEARCHES: i64 = 5;
const GAP_MIN_OCCURRENCES: i64 = 2;

/// Computes summaries over search and install events.
pub struct AnalyticsCollector {
    db: Arc<Database>,
}

impl AnalyticsCollector {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Everything at once, over the trailing `days_back` days.
    pub fn summary(&self, days_back: i64) -> Result<AnalyticsSummary> {
        if days_back <= 0 {
            return Err(Error::Validation(
                "days_back must be at least 1".to_string(),
            ));
        }
        let since = Utc::now() - Duration::days(days_back);

        Ok(AnalyticsSummary {
            days_back,
            top_queries: self.top_searches(days_back, TOP_QUERY_LIMIT)?,
            search_gaps: self.search_gaps(GAP_MIN_OCCURRENCES, Some(GapStatus::Open))?,
            ctr: self.click_through(days_back)?,
            trending_queries: self.trending_queries()?,
            funnel: self.conversion_funnel(days_back)?,
            position_clicks: self.position_clicks(since)?,
            user_activity: self.user_activity(days_back)?,
            popular_categories: self.popular_categories(days_back)?,
        })
    }

    /// Most frequent queries over a window.
    pub fn top_searches(&self, days_back: i64, limit: usize) -> Result<Vec<TopQuery>> {
        let since = Utc::now() - Duration::days(days_back);
        Ok(self
            .db
            .top_queries(since, limit)?
            .into_iter()
            .map(|q| TopQuery {
                query: q.query,
                count: q.count,
            })
            .collect())
    }

    /// Zero-result queries worth curating.
    pub fn search_gaps(
        &self,
        min_occurrences: i64,
        status: Option<GapStatus>,
    ) -> Result<Vec<SearchGap>> {
        self.db.search_gap_list(min_occurrences, status)
    }

    /// Click-through overall and for queries with at least five searches.
    pub fn click_through(&self, days_back: i64) -> Result<CtrSummary> {
        let since = Utc::now() - Duration::days(days_back);
        let (total_searches, total_clicks) = self.db.search_click_totals(since)?;
        let per_query = self
            .db
            .query_click_counts(since, CTR_MIN_SEARCHES, TOP_QUERY_LIMIT)?
            .into_iter()
            .map(|(query, searches, clicks)| QueryCtr {
                query,
                searches,
                clicks,
                ctr: ratio(clicks, searches),
            })
            .collect();
        Ok(CtrSummary {
            total_searches,
            total_clicks,
            overall_ctr: ratio(total_clicks, total_searches),
            per_query,
        })
    }

    /// Queries growing week over week; both weeks must be positive.
    pub fn trending_queries(&self) -> Result<Vec<TrendingQuery>> {
        let now = Utc::now();
        let rows = self
            .db
            .weekly_query_counts(now - Duration::days(7), now - Duration::days(14))?;
        let mut trending: Vec<TrendingQuery> = rows
            .into_iter()
            .filter(|(_, this_week, last_week)| *this_week > 0 && *last_week > 0)
            .map(|(query, this_week, last_week)| TrendingQuery {
                query,
                this_week,
                last_week,
                growth: this_week as f64 / last_week as f64,
            })
            .collect();
        trending.sort_by(|a, b| {
            b.growth
                .partial_cmp(&a.growth)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.query.cmp(&b.query))
        });
        Ok(trending)
    }

    /// Search conversion funnel over a window.
    pub fn conversion_funnel(&self, days_back: i64) -> Result<ConversionFunnel> {
        let since = Utc::now() - Duration::days(days_back);
        let (searches, with_results, clicked, installed) = self.db.funnel_counts(since)?;
        Ok(ConversionFunnel {
            searches,
            with_results,
            clicked,
            installed,
            click_through_rate: ratio(clicked, searches),
            conversion_rate: ratio(installed, clicked),
        })
    }

    fn position_clicks(&self, since: chrono::DateTime<Utc>) -> Result<Vec<PositionClicks>> {
        Ok(self
            .db
            .clicks_by_position(since)?
            .into_iter()
            .map(|(position, clicks)| PositionClicks { position, clicks })
            .collect())
    }

    /// Per-user search, click, and install volume.
    pub fn user_activity(&self, days_back: i64) -> Result<Vec<UserActivity>> {
        let since = Utc::now() - Duration::days(days_back);
        let installs: HashMap<String, i64> =
            self.db.installs_by_user(since)?.into_iter().collect();
        Ok(self
            .db
            .search_activity_by_user(since, USER_ACTIVITY_LIMIT)?
            .into_iter()
            .map(|(user_id, searches, clicks)| {
                let installs = installs.get(&user_id).copied().unwrap_or(0);
                UserActivity {
                    user_id,
                    searches,
                    clicks,
                    installs,
                }
            })
            .collect())
    }

    /// Categories ranked by install volume.
    pub fn popular_categories(&self, days_back: i64) -> Result<Vec<CategoryInstalls>> {
        let since = Utc::now() - Duration::days(days_back);
        Ok(self
            .db
            .installs_by_category(since)?
            .into_iter()
            .map(|(category, installs)| CategoryInstalls { category, installs })
            .collect())
    }

    /// Drop search events older than the cutoff and sweep the expired cache.
    /// Returns the number of events removed.
    pub fn cleanup(&self, days_to_keep: i64) -> Result<usize> {
        if days_to_keep <= 0 {
            return Err(Error::Validation(
                "days_to_keep must be at least 1".to_string(),
            ));
        }
        let cutoff = Utc::now() - Duration::days(days_to_keep);
        let deleted = self.db.delete_search_events_before(cutoff)?;
        let evicted = self.db.evict_expired_cache()?;
        tracing::info!(deleted, evicted, days_to_keep, "Analytics cleanup complete");
        Ok(deleted)
    }
}

fn ratio(numerator: i64, denominator: i64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, PluginRecord};

    struct Fixture {
        db: Arc<Database>,
        collector: AnalyticsCollector,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let collector = AnalyticsCollector::new(db.clone());
        Fixture { db, collector }
    }

    fn seed_plugin(db: &Database, id: &str, category: Category) {
        let plugin = PluginRecord::new(id, id, category);
        db.upsert_plugin(&plugin).unwrap();
    }

    #[test]
    fn test_top_searches_ordering() {
        let f = fixture();
        let filters = serde_json::json!({});
        for _ in 0..3 {
            f.db.insert_search_event("auth", &filters, 2, None, None).unwrap();
        }
        f.db.insert_search_event("logging", &filters, 1, None, None).unwrap();

        let top = f.collector.top_searches(7, 10).unwrap();
        assert_eq!(top[0].query, "auth");
        assert_eq!(top[0].count, 3);
        assert_eq!(top[1].query, "logging");
    }

    #[test]
    fn test_ctr_requires_volume() {
        let f = fixture();
        let filters = serde_json::json!({});
        for _ in 0..5 {
            f.db.insert_search_event("auth", &filters, 2, None, None).unwrap();
        }
        f.db.record_click("auth", "p1", 1, None).unwrap();
        // below the five-search floor
        f.db.insert_search_event("rare", &filters, 2, None, None).unwrap();

        let ctr = f.collector.click_through(7).unwrap();
        assert_eq!(ctr.total_searches, 6);
        assert_eq!(ctr.total_clicks, 1);
        assert_eq!(ctr.per_query.len(), 1);
        assert_eq!(ctr.per_query[0].query, "auth");
        assert!((ctr.per_query[0].ctr - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_funnel_counts_search_installs() {
        let f = fixture();
        seed_plugin(&f.db, "p1", Category::Agents);
        let filters = serde_json::json!({});
        f.db.insert_search_event("auth", &filters, 2, None, None).unwrap();
        f.db.insert_search_event("ghost", &filters, 0, None, None).unwrap();
        f.db.record_click("auth", "p1", 1, None).unwrap();
        f.db.record_install("p1", Some("u1"), None, Some("search")).unwrap();
        // not attributed to search
        f.db.record_install("p1", Some("u2"), None, Some("cli")).unwrap();

        let funnel = f.collector.conversion_funnel(7).unwrap();
        assert_eq!(funnel.searches, 2);
        assert_eq!(funnel.with_results, 1);
        assert_eq!(funnel.clicked, 1);
        assert_eq!(funnel.installed, 1);
        assert!((funnel.click_through_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_user_activity_merges_installs() {
        let f = fixture();
        seed_plugin(&f.db, "p1", Category::Tools);
        let filters = serde_json::json!({});
        f.db.insert_search_event("auth", &filters, 2, None, Some("u1")).unwrap();
        f.db.record_install("p1", Some("u1"), None, None).unwrap();

        let activity = f.collector.user_activity(7).unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].user_id, "u1");
        assert_eq!(activity[0].searches, 1);
        assert_eq!(activity[0].installs, 1);
    }

    #[test]
    fn test_popular_categories() {
        let f = fixture();
        seed_plugin(&f.db, "p1", Category::Agents);
        seed_plugin(&f.db, "p2", Category::Tools);
        f.db.record_install("p1", None, None, None).unwrap();
        f.db.record_install("p1", None, None, None).unwrap();
        f.db.record_install("p2", None, None, None).unwrap();

        let categories = f.collector.popular_categories(7).unwrap();
        assert_eq!(categories[0].category, "agents");
        assert_eq!(categories[0].installs, 2);
    }

    /// Insert a search event with an explicit timestamp, bypassing the
    /// repo's now() stamping.
    fn backdate_event(db: &Database, query: &str, days_ago: i64) {
        let ts = (Utc::now() - Duration::days(days_ago)).to_rfc3339();
        db.connection()
            .execute(
                "INSERT INTO search_events (query, filters, results_count, searched_at)
                 VALUES (?1, '{}', 1, ?2)",
                rusqlite::params![query, ts],
            )
            .unwrap();
    }

    #[test]
    fn test_trending_queries_growth() {
        let f = fixture();
        // "auth": 1 last week, 3 this week -> growth 3.0
        backdate_event(&f.db, "auth", 10);
        for _ in 0..3 {
            backdate_event(&f.db, "auth", 1);
        }
        // "logging": this week only -> excluded (no baseline)
        backdate_event(&f.db, "logging", 1);
        // "legacy": last week only -> excluded (no current volume)
        backdate_event(&f.db, "legacy", 10);

        let trending = f.collector.trending_queries().unwrap();
        assert_eq!(trending.len(), 1);
        assert_eq!(trending[0].query, "auth");
        assert_eq!(trending[0].this_week, 3);
        assert_eq!(trending[0].last_week, 1);
        assert!((trending[0].growth - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_cleanup_validates_and_deletes() {
        let f = fixture();
        assert!(matches!(
            f.collector.cleanup(0),
            Err(Error::Validation(_))
        ));

        backdate_event(&f.db, "ancient", 90);
        let filters = serde_json::json!({});
        f.db.insert_search_event("auth", &filters, 1, None, None).unwrap();

        // only the event past the cutoff is removed
        assert_eq!(f.collector.cleanup(30).unwrap(), 1);
        assert_eq!(f.collector.cleanup(30).unwrap(), 0);
        let remaining = f.db.recent_search_events(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].query, "auth");
    }

    #[test]
    fn test_summary_bundles_sections() {
        let f = fixture();
        let filters = serde_json::json!({});
        f.db.insert_search_event("auth", &filters, 1, None, None).unwrap();
        let summary = f.collector.summary(7).unwrap();
        assert_eq!(summary.days_back, 7);
        assert_eq!(summary.top_queries.len(), 1);
        assert!(summary.search_gaps.is_empty());
    }
}
