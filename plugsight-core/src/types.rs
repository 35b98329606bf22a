//! Core domain types for plugsight
//!
//! These types model the plugin corpus and the request/response surfaces of
//! the search, recommendation, and analytics engines.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Plugin** | A published extension manifest (name, description, keywords, README, tags, stats) |
//! | **Posting** | A `(term, plugin, field)` row with TF-IDF weights |
//! | **Membership** | A user's active installation of a plugin, denormalized from install events |
//! | **Relationship** | An undirected co-install edge between two plugins with a Jaccard confidence |
//! | **Gap** | A query observed to produce zero results, retained for curation |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Category
// ============================================

/// Plugin category (fixed enumerated set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Agents,
    Skills,
    Commands,
    Workflows,
    Hooks,
    Templates,
    Tools,
}

impl Category {
    /// All categories, in default sort order.
    pub fn all() -> [Category; 7] {
        [
            Category::Agents,
            Category::Skills,
            Category::Commands,
            Category::Workflows,
            Category::Hooks,
            Category::Templates,
            Category::Tools,
        ]
    }

    /// Returns the identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Agents => "agents",
            Category::Skills => "skills",
            Category::Commands => "commands",
            Category::Workflows => "workflows",
            Category::Hooks => "hooks",
            Category::Templates => "templates",
            Category::Tools => "tools",
        }
    }

    /// Returns the display name for this category
    pub fn display_name(&self) -> &'static str {
        match self {
            Category::Agents => "Agents",
            Category::Skills => "Skills",
            Category::Commands => "Commands",
            Category::Workflows => "Workflows",
            Category::Hooks => "Hooks",
            Category::Templates => "Templates",
            Category::Tools => "Tools",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agents" => Ok(Category::Agents),
            "skills" => Ok(Category::Skills),
            "commands" => Ok(Category::Commands),
            "workflows" => Ok(Category::Workflows),
            "hooks" => Ok(Category::Hooks),
            "templates" => Ok(Category::Templates),
            "tools" => Ok(Category::Tools),
            _ => Err(format!("unknown category: {}", s)),
        }
    }
}

// ============================================
// Plugin record
// ============================================

/// A plugin manifest as stored in the index.
///
/// `id` is externally assigned and globally unique. `downloads`, `rating`,
/// and `rating_count` are tracked side effects and survive re-ingest of the
/// same plugin; every other attribute is overwritten by the latest manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Stable external identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Manifest version string
    pub version: Option<String>,
    /// Short description
    pub description: Option<String>,
    /// Author name
    pub author_name: Option<String>,
    /// Author contact email
    pub author_email: Option<String>,
    /// SPDX license expression
    pub license: Option<String>,
    /// Homepage URL
    pub homepage: Option<String>,
    /// Repository URL
    pub repository: Option<String>,
    /// Category
    pub category: Category,
    /// Tags (sorted and deduplicated at ingest)
    pub tags: Vec<String>,
    /// Free-form keywords, whitespace-delimited
    pub keywords: Option<String>,
    /// README content (may be large)
    pub readme: Option<String>,
    /// Download count (incremented on recorded installs)
    pub downloads: i64,
    /// Average rating in [0, 5]
    pub rating: f64,
    /// Number of ratings folded into `rating`
    pub rating_count: i64,
    /// First ingest time
    pub created_at: DateTime<Utc>,
    /// Last ingest time
    pub updated_at: DateTime<Utc>,
    /// Publication time (drives the recency score)
    pub published_at: Option<DateTime<Utc>>,
    /// Upstream modification time
    pub last_modified_at: Option<DateTime<Utc>>,
    /// Featured flag (adds a relevance boost)
    pub is_featured: bool,
    /// Deprecated plugins stay indexed but are excluded from recommendations
    pub is_deprecated: bool,
    /// Opaque metadata blob
    pub metadata: serde_json::Value,
}

impl PluginRecord {
    /// Create a minimal record with sensible defaults for the rest.
    pub fn new(id: &str, name: &str, category: Category) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            version: None,
            description: None,
            author_name: None,
            author_email: None,
            license: None,
            homepage: None,
            repository: None,
            category,
            tags: Vec::new(),
            keywords: None,
            readme: None,
            downloads: 0,
            rating: 0.0,
            rating_count: 0,
            created_at: now,
            updated_at: now,
            published_at: None,
            last_modified_at: None,
            is_featured: false,
            is_deprecated: false,
            metadata: serde_json::json!({}),
        }
    }

    /// The derived broad-match text: name + description + keywords.
    pub fn search_text(&self) -> String {
        format!(
            "{} {} {}",
            self.name,
            self.description.as_deref().unwrap_or(""),
            self.keywords.as_deref().unwrap_or(""),
        )
        .trim()
        .to_string()
    }
}

/// Indexed plugin fields with separate postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginField {
    Name,
    Description,
    Keywords,
    Readme,
    Tags,
}

impl PluginField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginField::Name => "name",
            PluginField::Description => "description",
            PluginField::Keywords => "keywords",
            PluginField::Readme => "readme",
            PluginField::Tags => "tags",
        }
    }
}

impl std::str::FromStr for PluginField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(PluginField::Name),
            "description" => Ok(PluginField::Description),
            "keywords" => Ok(PluginField::Keywords),
            "readme" => Ok(PluginField::Readme),
            "tags" => Ok(PluginField::Tags),
            _ => Err(format!("unknown plugin field: {}", s)),
        }
    }
}

// ============================================
// Search
// ============================================

/// Sort key for search results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Relevance,
    Downloads,
    Rating,
    Recent,
    Name,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter predicates ANDed into the search query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Restrict to one category
    pub category: Option<Category>,
    /// Restrict to an author name (exact, case-insensitive)
    pub author: Option<String>,
    /// Minimum download count
    pub min_downloads: Option<i64>,
    /// Maximum download count
    pub max_downloads: Option<i64>,
    /// Minimum rating
    pub min_rating: Option<f64>,
    /// Only featured plugins
    pub featured_only: bool,
    /// Hide deprecated plugins (default true)
    pub exclude_deprecated: bool,
    /// Published on or after
    pub published_after: Option<DateTime<Utc>>,
    /// Published on or before
    pub published_before: Option<DateTime<Utc>>,
    /// Match plugins carrying any of these tags
    pub tags: Vec<String>,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            category: None,
            author: None,
            min_downloads: None,
            max_downloads: None,
            min_rating: None,
            featured_only: false,
            exclude_deprecated: true,
            published_after: None,
            published_before: None,
            tags: Vec::new(),
        }
    }
}

/// Options accepted by `search` and `fuzzy_search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default)]
    pub order: SortOrder,
    /// Page size (default 20)
    pub limit: usize,
    /// Page offset
    pub offset: usize,
    /// Include README bodies in results (default false; they can be large)
    pub include_readme: bool,
    /// Session identifier attached to the recorded search event
    pub session_id: Option<String>,
    /// User identifier attached to the recorded search event
    pub user_id: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            filters: SearchFilters::default(),
            sort: SortKey::default(),
            order: SortOrder::default(),
            limit: 20,
            offset: 0,
            include_readme: false,
            session_id: None,
            user_id: None,
        }
    }
}

/// A single ranked search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub plugin: PluginRecord,
    /// Combined relevance score
    pub score: f64,
    /// Fields containing at least one query token, for UI highlighting
    pub matched_fields: Vec<PluginField>,
}

/// One page of search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// The raw query as received
    pub query: String,
    pub results: Vec<SearchResult>,
    /// Total matches before pagination
    pub total: usize,
    /// Echo of the applied filters
    pub filters: SearchFilters,
    pub sort: SortKey,
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl SearchResponse {
    /// An empty page echoing the request shape.
    pub fn empty(query: &str, options: &SearchOptions) -> Self {
        Self {
            query: query.to_string(),
            results: Vec::new(),
            total: 0,
            filters: options.filters.clone(),
            sort: options.sort,
            order: options.order,
            limit: options.limit,
            offset: options.offset,
        }
    }
}

// ============================================
// Recommendations
// ============================================

/// Which signal produced a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Collaborative,
    ContentBased,
    Trending,
    Popular,
}

impl RecommendationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationKind::Collaborative => "collaborative",
            RecommendationKind::ContentBased => "content_based",
            RecommendationKind::Trending => "trending",
            RecommendationKind::Popular => "popular",
        }
    }
}

/// A ranked recommendation with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub plugin: PluginRecord,
    pub score: f64,
    /// Human-readable explanation, e.g. "Frequently installed together with X"
    pub reason: String,
    pub kind: RecommendationKind,
}

/// Request context for personalized recommendations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationContext {
    /// Currently installed plugin ids; unknown ids are silently dropped
    pub installed_plugins: Vec<String>,
    /// Category used for content-based top-up
    pub category: Option<Category>,
    /// Maximum results (default 10)
    pub limit: usize,
    /// Drop installed plugins from the output (default true)
    pub exclude_installed: bool,
}

impl Default for RecommendationContext {
    fn default() -> Self {
        Self {
            installed_plugins: Vec::new(),
            category: None,
            limit: 10,
            exclude_installed: true,
        }
    }
}

impl RecommendationContext {
    /// Deterministic serialization used for cache keys: stable field order,
    /// installed ids sorted and deduplicated.
    pub fn canonical(&self) -> String {
        let mut ids = self.installed_plugins.clone();
        ids.sort();
        ids.dedup();
        format!(
            "installed=[{}];category={};limit={};exclude_installed={}",
            ids.join(","),
            self.category.map(|c| c.as_str()).unwrap_or(""),
            self.limit,
            self.exclude_installed,
        )
    }

    /// Sorted, deduplicated installed ids.
    pub fn sorted_installed(&self) -> Vec<String> {
        let mut ids = self.installed_plugins.clone();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Trending window selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendingPeriod {
    Day,
    Week,
    Month,
}

impl TrendingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendingPeriod::Day => "day",
            TrendingPeriod::Week => "week",
            TrendingPeriod::Month => "month",
        }
    }
}

impl std::str::FromStr for TrendingPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(TrendingPeriod::Day),
            "week" => Ok(TrendingPeriod::Week),
            "month" => Ok(TrendingPeriod::Month),
            _ => Err(format!("unknown trending period: {}", s)),
        }
    }
}

// ============================================
// Index rows
// ============================================

/// One `(term, plugin, field)` posting with TF-IDF weights.
#[derive(Debug, Clone, PartialEq)]
pub struct TermPosting {
    pub term: String,
    pub plugin_id: String,
    pub field: PluginField,
    pub term_frequency: f64,
    pub inverse_document_frequency: f64,
    pub tfidf_score: f64,
}

/// Corpus-wide document frequency for one term.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentFrequency {
    pub term: String,
    pub document_count: i64,
    pub total_documents: i64,
    pub idf_score: f64,
}

/// An undirected co-install edge; `plugin_a < plugin_b` lexicographically.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRelationship {
    pub plugin_a: String,
    pub plugin_b: String,
    /// Users with both plugins active
    pub co_install_count: i64,
    /// Jaccard index over the two user sets, in [0, 1]
    pub confidence: f64,
}

/// Per-plugin install velocity over the trailing windows.
#[derive(Debug, Clone)]
pub struct TrendingRecord {
    pub plugin_id: String,
    pub installs_day: i64,
    pub installs_week: i64,
    pub installs_month: i64,
    pub velocity_score: f64,
    pub computed_at: DateTime<Utc>,
}

// ============================================
// Events
// ============================================

/// An append-only install observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallEvent {
    pub id: i64,
    pub plugin_id: String,
    pub user_id: Option<String>,
    pub version: Option<String>,
    /// Where the install came from, e.g. "search"
    pub source: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub uninstalled_at: Option<DateTime<Utc>>,
}

/// Installation source value joined by the conversion funnel.
pub const INSTALL_SOURCE_SEARCH: &str = "search";

/// A recorded search, optionally carrying the click that followed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchEvent {
    pub id: i64,
    pub query: String,
    /// Snapshot of the applied filters
    pub filters: serde_json::Value,
    pub results_count: i64,
    pub clicked_plugin_id: Option<String>,
    /// 1-based; set exactly when `clicked_plugin_id` is set
    pub click_position: Option<i64>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub searched_at: DateTime<Utc>,
}

/// Curation status of a search gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Open,
    Addressed,
    Ignored,
}

impl GapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapStatus::Open => "open",
            GapStatus::Addressed => "addressed",
            GapStatus::Ignored => "ignored",
        }
    }
}

impl std::str::FromStr for GapStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(GapStatus::Open),
            "addressed" => Ok(GapStatus::Addressed),
            "ignored" => Ok(GapStatus::Ignored),
            _ => Err(format!("unknown gap status: {}", s)),
        }
    }
}

/// A query observed to return zero results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchGap {
    pub query: String,
    pub results_count: i64,
    pub occurrence_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: GapStatus,
}

// ============================================
// Categories (metadata)
// ============================================

/// Category metadata with its derived plugin count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryInfo {
    pub category: Category,
    pub display_name: String,
    pub description: Option<String>,
    /// Non-deprecated plugins currently in the category
    pub plugin_count: i64,
    pub sort_order: i64,
    pub is_active: bool,
}

// ============================================
// Bulk ingest
// ============================================

/// Options for `build_index`.
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    /// Drop postings and rebuild from scratch instead of upserting
    pub rebuild: bool,
    /// Run a TF-IDF refresh after the upsert pass
    pub compute_tfidf: bool,
    /// Rebuild the co-install graph after the upsert pass
    pub update_relationships: bool,
    /// Refresh trending scores after the upsert pass
    pub update_trending: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            rebuild: false,
            compute_tfidf: true,
            update_relationships: true,
            update_trending: true,
        }
    }
}

/// Result of a bulk ingest.
#[derive(Debug, Default, Serialize)]
pub struct BuildReport {
    /// Records written
    pub indexed: usize,
    /// Records skipped (duplicate id within the batch)
    pub skipped: usize,
    /// Records rejected by validation
    pub failed: usize,
    /// Per-record errors (plugin id → message)
    pub errors: Vec<(String, String)>,
}

/// Index health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub plugins: i64,
    pub distinct_terms: i64,
    pub postings: i64,
    pub queued_for_reindex: i64,
    /// Fingerprint of the stop-word list the postings were built with
    pub stopword_fingerprint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_category_roundtrip() {
        for cat in Category::all() {
            assert_eq!(Category::from_str(cat.as_str()).unwrap(), cat);
        }
        assert!(Category::from_str("desserts").is_err());
    }

    #[test]
    fn test_filters_default_excludes_deprecated() {
        let filters = SearchFilters::default();
        assert!(filters.exclude_deprecated);
        assert!(!filters.featured_only);
    }

    #[test]
    fn test_context_canonical_is_order_independent() {
        let a = RecommendationContext {
            installed_plugins: vec!["b".into(), "a".into(), "a".into()],
            ..Default::default()
        };
        let b = RecommendationContext {
            installed_plugins: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        assert_eq!(a.canonical(), b.canonical());
        assert!(a.canonical().contains("installed=[a,b]"));
    }

    #[test]
    fn test_trending_period_parse() {
        assert_eq!(TrendingPeriod::from_str("week").unwrap(), TrendingPeriod::Week);
        assert!(TrendingPeriod::from_str("fortnight").is_err());
    }
}
