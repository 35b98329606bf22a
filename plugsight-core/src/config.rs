//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/plugsight/config.toml`

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Search scoring weights
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Recommendation cache TTLs
    #[serde(default)]
    pub cache: CacheConfig,

    /// Trending velocity weights
    #[serde(default)]
    pub trending: TrendingConfig,

    /// Search behavior
    #[serde(default)]
    pub search: SearchConfig,

    /// Indexing behavior
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Weights for the combined search score. By convention they sum to 1.0.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ScoringConfig {
    #[serde(default = "default_tfidf_weight")]
    pub tfidf_weight: f64,

    #[serde(default = "default_download_weight")]
    pub download_weight: f64,

    #[serde(default = "default_rating_weight")]
    pub rating_weight: f64,

    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,

    #[serde(default = "default_relevance_weight")]
    pub relevance_weight: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            tfidf_weight: default_tfidf_weight(),
            download_weight: default_download_weight(),
            rating_weight: default_rating_weight(),
            recency_weight: default_recency_weight(),
            relevance_weight: default_relevance_weight(),
        }
    }
}

fn default_tfidf_weight() -> f64 {
    0.4
}

fn default_download_weight() -> f64 {
    0.2
}

fn default_rating_weight() -> f64 {
    0.2
}

fn default_recency_weight() -> f64 {
    0.1
}

fn default_relevance_weight() -> f64 {
    0.1
}

/// TTLs (seconds) for cached recommendation payloads, per kind.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CacheConfig {
    #[serde(default = "default_collaborative_ttl")]
    pub collaborative_ttl_secs: i64,

    #[serde(default = "default_content_ttl")]
    pub content_ttl_secs: i64,

    #[serde(default = "default_trending_ttl")]
    pub trending_ttl_secs: i64,

    #[serde(default = "default_similar_ttl")]
    pub similar_ttl_secs: i64,

    /// TTL for the blended personalized list
    #[serde(default = "default_personalized_ttl")]
    pub personalized_ttl_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            collaborative_ttl_secs: default_collaborative_ttl(),
            content_ttl_secs: default_content_ttl(),
            trending_ttl_secs: default_trending_ttl(),
            similar_ttl_secs: default_similar_ttl(),
            personalized_ttl_secs: default_personalized_ttl(),
        }
    }
}

fn default_collaborative_ttl() -> i64 {
    3600
}

fn default_content_ttl() -> i64 {
    7200
}

fn default_trending_ttl() -> i64 {
    1800
}

fn default_similar_ttl() -> i64 {
    3600
}

fn default_personalized_ttl() -> i64 {
    3600
}

/// Weights for the install-velocity score: `day·d + week·w + month·m`.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct TrendingConfig {
    #[serde(default = "default_day_weight")]
    pub day_weight: f64,

    #[serde(default = "default_week_weight")]
    pub week_weight: f64,

    #[serde(default = "default_month_weight")]
    pub month_weight: f64,
}

impl Default for TrendingConfig {
    fn default() -> Self {
        Self {
            day_weight: default_day_weight(),
            week_weight: default_week_weight(),
            month_weight: default_month_weight(),
        }
    }
}

fn default_day_weight() -> f64 {
    10.0
}

fn default_week_weight() -> f64 {
    3.0
}

fn default_month_weight() -> f64 {
    1.0
}

/// Search behavior knobs.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct SearchConfig {
    /// Exact-match result count below which fuzzy search expands to prefixes
    #[serde(default = "default_fuzzy_min_results")]
    pub fuzzy_min_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fuzzy_min_results: default_fuzzy_min_results(),
        }
    }
}

fn default_fuzzy_min_results() -> usize {
    5
}

/// Indexing behavior knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Apply the shallow stemmer (disable for exact-token indexes)
    #[serde(default = "default_stemming")]
    pub stemming: bool,

    /// Pin the expected stop-word fingerprint; a mismatch with the built-in
    /// list fails engine startup instead of producing a skewed index
    #[serde(default)]
    pub stopword_fingerprint: Option<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            stemming: default_stemming(),
            stopword_fingerprint: None,
        }
    }
}

fn default_stemming() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level for plugsight's own targets (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from the default location; a missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(Error::Config(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Load from an explicit path; here the file must exist.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject weight sets that would silently distort ranking.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        let weights = [
            s.tfidf_weight,
            s.download_weight,
            s.rating_weight,
            s.recency_weight,
            s.relevance_weight,
        ];
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(Error::Config(
                "scoring weights must be finite and nonnegative".to_string(),
            ));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 0.01 {
            return Err(Error::Config(format!(
                "scoring weights must sum to 1.0 (got {:.3})",
                sum
            )));
        }

        let ttls = [
            self.cache.collaborative_ttl_secs,
            self.cache.content_ttl_secs,
            self.cache.trending_ttl_secs,
            self.cache.similar_ttl_secs,
            self.cache.personalized_ttl_secs,
        ];
        if ttls.iter().any(|t| *t <= 0) {
            return Err(Error::Config("cache TTLs must be positive".to_string()));
        }

        Ok(())
    }

    /// Every filesystem location is the per-concern XDG base dir with a
    /// `plugsight` namespace underneath, falling back to the working
    /// directory when the platform reports none.
    fn app_dir(base: Option<PathBuf>) -> PathBuf {
        base.unwrap_or_else(|| PathBuf::from(".")).join("plugsight")
    }

    /// Default config file location (`<config>/plugsight/config.toml`)
    pub fn config_path() -> PathBuf {
        Self::app_dir(dirs::config_dir()).join("config.toml")
    }

    /// Data directory holding the SQLite index
    pub fn data_dir() -> PathBuf {
        Self::app_dir(dirs::data_local_dir())
    }

    /// State directory holding logs
    pub fn state_dir() -> PathBuf {
        Self::app_dir(dirs::state_dir().or_else(dirs::data_local_dir))
    }

    /// Default database file location (`<data>/plugsight/index.db`)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("index.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scoring.tfidf_weight, 0.4);
        assert_eq!(config.cache.trending_ttl_secs, 1800);
        assert_eq!(config.trending.day_weight, 10.0);
        assert_eq!(config.search.fuzzy_min_results, 5);
        assert!(config.indexing.stemming);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[scoring]
tfidf_weight = 0.5
download_weight = 0.2
rating_weight = 0.1
recency_weight = 0.1
relevance_weight = 0.1

[trending]
day_weight = 8.0

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.scoring.tfidf_weight, 0.5);
        assert_eq!(config.trending.day_weight, 8.0);
        // untouched sections keep defaults
        assert_eq!(config.trending.week_weight, 3.0);
        assert_eq!(config.cache.similar_ttl_secs, 3600);
        assert_eq!(config.logging.level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = Config::default();
        config.scoring.tfidf_weight = 0.9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scoring.rating_weight = -0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = Config::default();
        config.cache.trending_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_validates_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        // weights no longer sum to 1.0 once tfidf is bumped alone
        std::fs::write(&path, "[scoring]\ntfidf_weight = 0.9\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));

        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_paths_are_namespaced() {
        assert!(Config::config_path().ends_with("plugsight/config.toml"));
        assert!(Config::database_path().ends_with("plugsight/index.db"));
    }
}
