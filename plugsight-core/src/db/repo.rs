//! Database repository layer
//!
//! Provides query and write operations for all entity types. All multi-row
//! maintenance writes (bulk upsert, posting rebuild, relationship recompute,
//! trending refresh) run inside a single transaction; readers never observe a
//! partial state.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// A full-text candidate with the backend rank (`bm25`, lower is better).
#[derive(Debug, Clone)]
pub struct FtsCandidate {
    pub plugin: PluginRecord,
    pub rank: f64,
}

/// Per-plugin install counts over the trailing windows.
#[derive(Debug, Clone)]
pub struct InstallCounts {
    pub plugin_id: String,
    pub day: i64,
    pub week: i64,
    pub month: i64,
}

/// A query and how often it was issued.
#[derive(Debug, Clone)]
pub struct QueryCount {
    pub query: String,
    pub count: i64,
}

/// Index metadata key holding the stop-word fingerprint of the last refresh.
pub const META_STOPWORD_FINGERPRINT: &str = "stopword_fingerprint";

/// Database handle with a single serialized connection
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file at `path`, creating missing parent
    /// directories on the way.
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::configure(Connection::open(path)?, true)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?, false)
    }

    /// Apply connection pragmas. WAL and the enlarged page cache only make
    /// sense for on-disk databases; foreign keys are enforced everywhere.
    fn configure(conn: Connection, on_disk: bool) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if on_disk {
            // WAL keeps readers unblocked while the indexer holds the writer
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA cache_size = -32000;",
            )?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Direct connection access, for maintenance queries and tests
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Plugin operations
    // ============================================

    /// Insert or update a plugin by id.
    ///
    /// On update, `downloads`, `rating`, `rating_count`, and `created_at`
    /// are preserved; everything else is overwritten by the new manifest.
    pub fn upsert_plugin(&self, plugin: &PluginRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::upsert_plugin_on(&conn, plugin)
    }

    /// Upsert a batch of plugins in one transaction.
    pub fn upsert_plugins(&self, plugins: &[PluginRecord]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for plugin in plugins {
            Self::upsert_plugin_on(&tx, plugin)?;
        }
        tx.commit()?;
        Ok(plugins.len())
    }

    fn upsert_plugin_on(conn: &Connection, plugin: &PluginRecord) -> Result<()> {
        let tags_text = plugin.tags.join(" ");
        let search_keywords = plugin.search_text();

        conn.execute(
            r#"
            INSERT INTO plugins (id, name, version, description, author_name, author_email,
                                 license, homepage, repository, category, tags, tags_text,
                                 keywords, search_keywords, readme, downloads, rating,
                                 rating_count, created_at, updated_at, published_at,
                                 last_modified_at, is_featured, is_deprecated, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                description = excluded.description,
                author_name = excluded.author_name,
                author_email = excluded.author_email,
                license = excluded.license,
                homepage = excluded.homepage,
                repository = excluded.repository,
                category = excluded.category,
                tags = excluded.tags,
                tags_text = excluded.tags_text,
                keywords = excluded.keywords,
                search_keywords = excluded.search_keywords,
                readme = excluded.readme,
                updated_at = excluded.updated_at,
                published_at = excluded.published_at,
                last_modified_at = excluded.last_modified_at,
                is_featured = excluded.is_featured,
                is_deprecated = excluded.is_deprecated,
                metadata = excluded.metadata
            "#,
            params![
                plugin.id,
                plugin.name,
                plugin.version,
                plugin.description,
                plugin.author_name,
                plugin.author_email,
                plugin.license,
                plugin.homepage,
                plugin.repository,
                plugin.category.as_str(),
                serde_json::to_string(&plugin.tags).unwrap_or_else(|_| "[]".to_string()),
                tags_text,
                plugin.keywords,
                search_keywords,
                plugin.readme,
                plugin.downloads,
                plugin.rating,
                plugin.rating_count,
                plugin.created_at.to_rfc3339(),
                plugin.updated_at.to_rfc3339(),
                plugin.published_at.map(|t| t.to_rfc3339()),
                plugin.last_modified_at.map(|t| t.to_rfc3339()),
                plugin.is_featured,
                plugin.is_deprecated,
                plugin.metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Get a plugin by ID
    pub fn get_plugin(&self, id: &str) -> Result<Option<PluginRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM plugins WHERE id = ?", [id], |row| {
            Self::row_to_plugin(row)
        })
        .optional()
        .map_err(Error::from)
    }

    /// Get several plugins by id; missing ids are silently absent.
    pub fn get_plugins(&self, ids: &[String]) -> Result<Vec<PluginRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT * FROM plugins WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(ids.iter().map(|id| Value::Text(id.clone()))),
            |row| Self::row_to_plugin(row),
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn plugin_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM plugins WHERE id = ?", [id], |r| {
                r.get(0)
            })?;
        Ok(count > 0)
    }

    /// Count plugins, optionally restricted to non-deprecated ones.
    pub fn count_plugins(&self, exclude_deprecated: bool) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let sql = if exclude_deprecated {
            "SELECT COUNT(*) FROM plugins WHERE is_deprecated = 0"
        } else {
            "SELECT COUNT(*) FROM plugins"
        };
        conn.query_row(sql, [], |r| r.get(0)).map_err(Error::from)
    }

    /// All plugins, deprecated included (they stay indexed).
    pub fn all_plugins(&self) -> Result<Vec<PluginRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM plugins ORDER BY id")?;
        let rows = stmt.query_map([], |row| Self::row_to_plugin(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Non-deprecated plugins, the recommendation candidate pool.
    pub fn active_plugins(&self) -> Result<Vec<PluginRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM plugins WHERE is_deprecated = 0 ORDER BY id")?;
        let rows = stmt.query_map([], |row| Self::row_to_plugin(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Increment the download counter by one.
    pub fn increment_downloads(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE plugins SET downloads = downloads + 1 WHERE id = ?",
            [id],
        )?;
        Ok(())
    }

    /// Fold one new rating into the running average.
    pub fn apply_rating(&self, id: &str, rating: f64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE plugins
            SET rating = (rating * rating_count + ?2) / (rating_count + 1),
                rating_count = rating_count + 1
            WHERE id = ?1
            "#,
            params![id, rating],
        )?;
        Ok(changed > 0)
    }

    /// Top plugins by download count.
    pub fn popular(&self, limit: usize) -> Result<Vec<PluginRecord>> {
        self.plugin_listing(
            "SELECT * FROM plugins WHERE is_deprecated = 0
             ORDER BY downloads DESC, rating DESC, id ASC LIMIT ?",
            limit,
        )
    }

    /// Most recently updated plugins.
    pub fn recently_updated(&self, limit: usize) -> Result<Vec<PluginRecord>> {
        self.plugin_listing(
            "SELECT * FROM plugins WHERE is_deprecated = 0
             ORDER BY updated_at DESC, id ASC LIMIT ?",
            limit,
        )
    }

    /// Featured plugins.
    pub fn featured(&self, limit: usize) -> Result<Vec<PluginRecord>> {
        self.plugin_listing(
            "SELECT * FROM plugins WHERE is_deprecated = 0 AND is_featured = 1
             ORDER BY downloads DESC, id ASC LIMIT ?",
            limit,
        )
    }

    /// Top plugins in one category, by downloads then rating.
    pub fn popular_in_category(&self, category: Category, limit: usize) -> Result<Vec<PluginRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM plugins WHERE is_deprecated = 0 AND category = ?1
             ORDER BY downloads DESC, rating DESC, id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![category.as_str(), limit as i64], |row| {
            Self::row_to_plugin(row)
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    fn plugin_listing(&self, sql: &str, limit: usize) -> Result<Vec<PluginRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([limit as i64], |row| Self::row_to_plugin(row))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    fn row_to_plugin(row: &Row) -> rusqlite::Result<PluginRecord> {
        let category_str: String = row.get("category")?;
        let tags_str: String = row.get("tags")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let published_at: Option<String> = row.get("published_at")?;
        let last_modified_at: Option<String> = row.get("last_modified_at")?;
        let metadata_str: Option<String> = row.get("metadata")?;

        Ok(PluginRecord {
            id: row.get("id")?,
            name: row.get("name")?,
            version: row.get("version")?,
            description: row.get("description")?,
            author_name: row.get("author_name")?,
            author_email: row.get("author_email")?,
            license: row.get("license")?,
            homepage: row.get("homepage")?,
            repository: row.get("repository")?,
            category: category_str.parse().unwrap_or(Category::Tools),
            tags: serde_json::from_str(&tags_str).unwrap_or_default(),
            keywords: row.get("keywords")?,
            readme: row.get("readme")?,
            downloads: row.get("downloads")?,
            rating: row.get("rating")?,
            rating_count: row.get("rating_count")?,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
            published_at: parse_ts_opt(published_at),
            last_modified_at: parse_ts_opt(last_modified_at),
            is_featured: row.get("is_featured")?,
            is_deprecated: row.get("is_deprecated")?,
            metadata: metadata_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::json!({})),
        })
    }

    // ============================================
    // Full-text lookup
    // ============================================

    /// Candidates matching an FTS5 expression, with filter predicates ANDed
    /// in SQL. Returns every match; scoring and pagination happen upstream.
    pub fn fulltext_candidates(
        &self,
        match_expr: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<FtsCandidate>> {
        let mut sql = String::from(
            "SELECT p.*, bm25(plugin_fts) AS rank
             FROM plugin_fts
             JOIN plugins p ON p.rowid = plugin_fts.rowid
             WHERE plugin_fts MATCH ?",
        );
        let mut values: Vec<Value> = vec![Value::Text(match_expr.to_string())];

        if let Some(category) = filters.category {
            sql.push_str(" AND p.category = ?");
            values.push(Value::Text(category.as_str().to_string()));
        }
        if let Some(author) = &filters.author {
            sql.push_str(" AND LOWER(p.author_name) = LOWER(?)");
            values.push(Value::Text(author.clone()));
        }
        if let Some(min) = filters.min_downloads {
            sql.push_str(" AND p.downloads >= ?");
            values.push(Value::Integer(min));
        }
        if let Some(max) = filters.max_downloads {
            sql.push_str(" AND p.downloads <= ?");
            values.push(Value::Integer(max));
        }
        if let Some(min) = filters.min_rating {
            sql.push_str(" AND p.rating >= ?");
            values.push(Value::Real(min));
        }
        if filters.featured_only {
            sql.push_str(" AND p.is_featured = 1");
        }
        if filters.exclude_deprecated {
            sql.push_str(" AND p.is_deprecated = 0");
        }
        if let Some(after) = filters.published_after {
            sql.push_str(" AND p.published_at >= ?");
            values.push(Value::Text(after.to_rfc3339()));
        }
        if let Some(before) = filters.published_before {
            sql.push_str(" AND p.published_at <= ?");
            values.push(Value::Text(before.to_rfc3339()));
        }
        if !filters.tags.is_empty() {
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each(p.tags) je WHERE je.value IN ({}))",
                placeholders(filters.tags.len())
            ));
            for tag in &filters.tags {
                values.push(Value::Text(tag.clone()));
            }
        }
        sql.push_str(" ORDER BY rank, p.id");

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(FtsCandidate {
                plugin: Self::row_to_plugin(row)?,
                rank: row.get("rank")?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Plugin names matching a partial stem in name or keywords.
    pub fn suggest_names(&self, fragment: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name FROM plugins
             WHERE is_deprecated = 0
               AND (name LIKE '%' || ?1 || '%' OR search_keywords LIKE '%' || ?1 || '%')
             ORDER BY downloads DESC, name ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![fragment, limit as i64], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // ============================================
    // Term postings and document frequency
    // ============================================

    /// Replace postings and rebuild document frequencies in one transaction.
    ///
    /// `scope = None` replaces the whole posting table (full refresh);
    /// `scope = Some(ids)` replaces only those plugins' rows (incremental).
    /// Either way document frequencies and every posting's idf/tfidf are
    /// recomputed against the current non-deprecated corpus, the stop-word
    /// fingerprint is persisted, and the processed queue entries are cleared.
    pub fn rebuild_postings(
        &self,
        scope: Option<&[String]>,
        postings: &[TermPosting],
        fingerprint: &str,
    ) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        match scope {
            None => {
                tx.execute("DELETE FROM term_postings", [])?;
            }
            Some(ids) => {
                if !ids.is_empty() {
                    let sql = format!(
                        "DELETE FROM term_postings WHERE plugin_id IN ({})",
                        placeholders(ids.len())
                    );
                    tx.execute(
                        &sql,
                        params_from_iter(ids.iter().map(|id| Value::Text(id.clone()))),
                    )?;
                }
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO term_postings
                     (term, plugin_id, field, term_frequency, inverse_document_frequency, tfidf_score)
                 VALUES (?1, ?2, ?3, ?4, 0, 0)",
            )?;
            for posting in postings {
                stmt.execute(params![
                    posting.term,
                    posting.plugin_id,
                    posting.field.as_str(),
                    posting.term_frequency,
                ])?;
            }
        }

        let total_documents: i64 =
            tx.query_row("SELECT COUNT(*) FROM plugins WHERE is_deprecated = 0", [], |r| {
                r.get(0)
            })?;

        // Document frequency counts only non-deprecated documents; terms that
        // survive solely in deprecated plugins keep a row with count zero.
        let term_dfs: Vec<(String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT tp.term,
                        COUNT(DISTINCT CASE WHEN p.is_deprecated = 0 THEN tp.plugin_id END)
                 FROM term_postings tp
                 JOIN plugins p ON p.id = tp.plugin_id
                 GROUP BY tp.term",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        tx.execute("DELETE FROM document_frequency", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO document_frequency (term, document_count, total_documents, idf_score)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (term, df) in &term_dfs {
                let idf = ((1.0 + total_documents as f64) / (1.0 + *df as f64)).ln() + 1.0;
                stmt.execute(params![term, df, total_documents, idf])?;
            }
        }

        tx.execute(
            "UPDATE term_postings
             SET inverse_document_frequency =
                     (SELECT idf_score FROM document_frequency d WHERE d.term = term_postings.term),
                 tfidf_score = term_frequency *
                     (SELECT idf_score FROM document_frequency d WHERE d.term = term_postings.term)",
            [],
        )?;

        tx.execute(
            "INSERT INTO index_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![META_STOPWORD_FINGERPRINT, fingerprint, now],
        )?;

        match scope {
            None => {
                tx.execute("DELETE FROM reindex_queue", [])?;
            }
            Some(ids) => {
                if !ids.is_empty() {
                    let sql = format!(
                        "DELETE FROM reindex_queue WHERE plugin_id IN ({})",
                        placeholders(ids.len())
                    );
                    tx.execute(
                        &sql,
                        params_from_iter(ids.iter().map(|id| Value::Text(id.clone()))),
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(postings.len())
    }

    /// Sum of tfidf scores per plugin over the given terms.
    pub fn tfidf_sums(
        &self,
        plugin_ids: &[String],
        terms: &[String],
    ) -> Result<HashMap<String, f64>> {
        if plugin_ids.is_empty() || terms.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT plugin_id, SUM(tfidf_score) FROM term_postings
             WHERE plugin_id IN ({}) AND term IN ({})
             GROUP BY plugin_id",
            placeholders(plugin_ids.len()),
            placeholders(terms.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let values = plugin_ids
            .iter()
            .chain(terms.iter())
            .map(|s| Value::Text(s.clone()));
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        let mut sums = HashMap::new();
        for row in rows {
            let (id, sum) = row?;
            sums.insert(id, sum);
        }
        Ok(sums)
    }

    /// All postings for one plugin (diagnostics and tests).
    pub fn postings_for_plugin(&self, plugin_id: &str) -> Result<Vec<TermPosting>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT term, plugin_id, field, term_frequency, inverse_document_frequency, tfidf_score
             FROM term_postings WHERE plugin_id = ? ORDER BY field, term",
        )?;
        let rows = stmt.query_map([plugin_id], |row| {
            let field: String = row.get(2)?;
            Ok(TermPosting {
                term: row.get(0)?,
                plugin_id: row.get(1)?,
                field: field.parse().unwrap_or(PluginField::Keywords),
                term_frequency: row.get(3)?,
                inverse_document_frequency: row.get(4)?,
                tfidf_score: row.get(5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Document frequency row for one term.
    pub fn document_frequency(&self, term: &str) -> Result<Option<DocumentFrequency>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT term, document_count, total_documents, idf_score
             FROM document_frequency WHERE term = ?",
            [term],
            |row| {
                Ok(DocumentFrequency {
                    term: row.get(0)?,
                    document_count: row.get(1)?,
                    total_documents: row.get(2)?,
                    idf_score: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    // ============================================
    // Reindex queue and index metadata
    // ============================================

    pub fn enqueue_reindex(&self, plugin_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO reindex_queue (plugin_id, queued_at) VALUES (?1, ?2)
             ON CONFLICT(plugin_id) DO UPDATE SET queued_at = excluded.queued_at",
            params![plugin_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn queued_plugin_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT plugin_id FROM reindex_queue ORDER BY queued_at, plugin_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn get_index_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT value FROM index_meta WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()
        .map_err(Error::from)
    }

    /// Index health snapshot.
    pub fn index_stats(&self) -> Result<IndexStats> {
        let conn = self.conn.lock().unwrap();
        let plugins: i64 = conn.query_row("SELECT COUNT(*) FROM plugins", [], |r| r.get(0))?;
        let distinct_terms: i64 =
            conn.query_row("SELECT COUNT(*) FROM document_frequency", [], |r| r.get(0))?;
        let postings: i64 =
            conn.query_row("SELECT COUNT(*) FROM term_postings", [], |r| r.get(0))?;
        let queued: i64 =
            conn.query_row("SELECT COUNT(*) FROM reindex_queue", [], |r| r.get(0))?;
        let fingerprint: Option<String> = conn
            .query_row(
                "SELECT value FROM index_meta WHERE key = ?",
                [META_STOPWORD_FINGERPRINT],
                |r| r.get(0),
            )
            .optional()?;
        Ok(IndexStats {
            plugins,
            distinct_terms,
            postings,
            queued_for_reindex: queued,
            stopword_fingerprint: fingerprint,
        })
    }

    // ============================================
    // Co-install relationships
    // ============================================

    /// Replace the whole relationship table in one transaction.
    pub fn replace_relationships(&self, relationships: &[PluginRelationship]) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM plugin_relationships", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO plugin_relationships
                     (plugin_a, plugin_b, co_install_count, confidence, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for rel in relationships {
                stmt.execute(params![
                    rel.plugin_a,
                    rel.plugin_b,
                    rel.co_install_count,
                    rel.confidence,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(relationships.len())
    }

    /// All relationships touching any of the given plugins.
    pub fn relationships_for(&self, plugin_ids: &[String]) -> Result<Vec<PluginRelationship>> {
        if plugin_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT plugin_a, plugin_b, co_install_count, confidence
             FROM plugin_relationships
             WHERE plugin_a IN ({0}) OR plugin_b IN ({0})",
            placeholders(plugin_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let values = plugin_ids
            .iter()
            .chain(plugin_ids.iter())
            .map(|s| Value::Text(s.clone()));
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(PluginRelationship {
                plugin_a: row.get(0)?,
                plugin_b: row.get(1)?,
                co_install_count: row.get(2)?,
                confidence: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Look up one pair in either direction.
    pub fn get_relationship(&self, a: &str, b: &str) -> Result<Option<PluginRelationship>> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT plugin_a, plugin_b, co_install_count, confidence
             FROM plugin_relationships WHERE plugin_a = ?1 AND plugin_b = ?2",
            params![lo, hi],
            |row| {
                Ok(PluginRelationship {
                    plugin_a: row.get(0)?,
                    plugin_b: row.get(1)?,
                    co_install_count: row.get(2)?,
                    confidence: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    // ============================================
    // Trending
    // ============================================

    /// Replace the trending table in one transaction.
    pub fn replace_trending(&self, records: &[TrendingRecord]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM trending_plugins", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO trending_plugins
                     (plugin_id, installs_day, installs_week, installs_month, velocity_score, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for rec in records {
                stmt.execute(params![
                    rec.plugin_id,
                    rec.installs_day,
                    rec.installs_week,
                    rec.installs_month,
                    rec.velocity_score,
                    rec.computed_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Trending rows joined with their plugins, deprecated excluded.
    pub fn top_trending(&self, limit: usize) -> Result<Vec<(TrendingRecord, PluginRecord)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT t.plugin_id, t.installs_day, t.installs_week, t.installs_month,
                    t.velocity_score, t.computed_at, p.*
             FROM trending_plugins t
             JOIN plugins p ON p.id = t.plugin_id
             WHERE p.is_deprecated = 0
             ORDER BY t.velocity_score DESC, p.downloads DESC, p.id ASC
             LIMIT ?",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let computed_at: String = row.get(5)?;
            Ok((
                TrendingRecord {
                    plugin_id: row.get(0)?,
                    installs_day: row.get(1)?,
                    installs_week: row.get(2)?,
                    installs_month: row.get(3)?,
                    velocity_score: row.get(4)?,
                    computed_at: parse_ts(&computed_at),
                },
                Self::row_to_plugin(row)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Install counts per plugin for the trailing day/week/month windows.
    pub fn install_counts_since(
        &self,
        day_cutoff: DateTime<Utc>,
        week_cutoff: DateTime<Utc>,
        month_cutoff: DateTime<Utc>,
    ) -> Result<Vec<InstallCounts>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT plugin_id,
                    SUM(CASE WHEN installed_at >= ?1 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN installed_at >= ?2 THEN 1 ELSE 0 END),
                    COUNT(*)
             FROM install_events
             WHERE installed_at >= ?3
             GROUP BY plugin_id",
        )?;
        let rows = stmt.query_map(
            params![
                day_cutoff.to_rfc3339(),
                week_cutoff.to_rfc3339(),
                month_cutoff.to_rfc3339(),
            ],
            |row| {
                Ok(InstallCounts {
                    plugin_id: row.get(0)?,
                    day: row.get(1)?,
                    week: row.get(2)?,
                    month: row.get(3)?,
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // ============================================
    // Install events and memberships
    // ============================================

    /// Record an install: append the event, refresh the membership row, and
    /// bump the download counter, all in one transaction.
    pub fn record_install(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        version: Option<&str>,
        source: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let exists: i64 =
            tx.query_row("SELECT COUNT(*) FROM plugins WHERE id = ?", [plugin_id], |r| {
                r.get(0)
            })?;
        if exists == 0 {
            return Err(Error::PluginNotFound(plugin_id.to_string()));
        }

        tx.execute(
            "INSERT INTO install_events (plugin_id, user_id, version, source, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![plugin_id, user_id, version, source, now],
        )?;

        if let Some(user) = user_id {
            tx.execute(
                "INSERT INTO user_plugins (user_id, plugin_id, installed_at, is_active)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(user_id, plugin_id) DO UPDATE SET
                     is_active = 1,
                     installed_at = excluded.installed_at",
                params![user, plugin_id, now],
            )?;
        }

        tx.execute(
            "UPDATE plugins SET downloads = downloads + 1 WHERE id = ?",
            [plugin_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Close the latest open install event and deactivate the membership.
    /// Returns false when there was nothing to close.
    pub fn record_uninstall(&self, plugin_id: &str, user_id: Option<&str>) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE install_events SET uninstalled_at = ?1
             WHERE id = (
                 SELECT id FROM install_events
                 WHERE plugin_id = ?2
                   AND (?3 IS NULL OR user_id = ?3)
                   AND uninstalled_at IS NULL
                 ORDER BY installed_at DESC, id DESC LIMIT 1
             )",
            params![now, plugin_id, user_id],
        )?;

        if let Some(user) = user_id {
            tx.execute(
                "UPDATE user_plugins SET is_active = 0 WHERE user_id = ?1 AND plugin_id = ?2",
                params![user, plugin_id],
            )?;
        }

        tx.commit()?;
        Ok(changed > 0)
    }

    /// All active (user, plugin) memberships, the co-install miner's input.
    pub fn active_memberships(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, plugin_id FROM user_plugins WHERE is_active = 1
             ORDER BY user_id, plugin_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // ============================================
    // Search events and gaps
    // ============================================

    pub fn insert_search_event(
        &self,
        query: &str,
        filters: &serde_json::Value,
        results_count: i64,
        session_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO search_events (query, filters, results_count, session_id, user_id, searched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                query,
                filters.to_string(),
                results_count,
                session_id,
                user_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Attach a click to the most recent matching un-clicked search event.
    /// Returns false when no such event exists; nothing is fabricated.
    pub fn record_click(
        &self,
        query: &str,
        plugin_id: &str,
        position: i64,
        session_id: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE search_events SET clicked_plugin_id = ?1, click_position = ?2
             WHERE id = (
                 SELECT id FROM search_events
                 WHERE query = ?3
                   AND clicked_plugin_id IS NULL
                   AND (?4 IS NULL OR session_id = ?4)
                 ORDER BY searched_at DESC, id DESC LIMIT 1
             )",
            params![plugin_id, position, query, session_id],
        )?;
        Ok(changed > 0)
    }

    /// Insert a gap row for a zero-result query, or bump its occurrence count.
    pub fn upsert_search_gap(&self, query: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO search_gaps (query, results_count, occurrence_count, first_seen, last_seen, status)
             VALUES (?1, 0, 1, ?2, ?2, 'open')
             ON CONFLICT(query) DO UPDATE SET
                 occurrence_count = occurrence_count + 1,
                 last_seen = excluded.last_seen",
            params![query, now],
        )?;
        Ok(())
    }

    pub fn get_search_gap(&self, query: &str) -> Result<Option<SearchGap>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT query, results_count, occurrence_count, first_seen, last_seen, status
             FROM search_gaps WHERE query = ?",
            [query],
            Self::row_to_gap,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Gaps with at least `min_occurrences`, optionally filtered by status.
    pub fn search_gap_list(
        &self,
        min_occurrences: i64,
        status: Option<GapStatus>,
    ) -> Result<Vec<SearchGap>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT query, results_count, occurrence_count, first_seen, last_seen, status
             FROM search_gaps WHERE occurrence_count >= ?1",
        );
        let mut values: Vec<Value> = vec![Value::Integer(min_occurrences)];
        if let Some(status) = status {
            sql.push_str(" AND status = ?2");
            values.push(Value::Text(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY occurrence_count DESC, last_seen DESC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::row_to_gap)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    fn row_to_gap(row: &Row) -> rusqlite::Result<SearchGap> {
        let first_seen: String = row.get(3)?;
        let last_seen: String = row.get(4)?;
        let status: String = row.get(5)?;
        Ok(SearchGap {
            query: row.get(0)?,
            results_count: row.get(1)?,
            occurrence_count: row.get(2)?,
            first_seen: parse_ts(&first_seen),
            last_seen: parse_ts(&last_seen),
            status: status.parse().unwrap_or(GapStatus::Open),
        })
    }

    /// Most recent search events (diagnostics and tests).
    pub fn recent_search_events(&self, limit: usize) -> Result<Vec<SearchEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, query, filters, results_count, clicked_plugin_id, click_position,
                    session_id, user_id, searched_at
             FROM search_events ORDER BY searched_at DESC, id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let filters: Option<String> = row.get(2)?;
            let searched_at: String = row.get(8)?;
            Ok(SearchEvent {
                id: row.get(0)?,
                query: row.get(1)?,
                filters: filters
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(serde_json::json!({})),
                results_count: row.get(3)?,
                clicked_plugin_id: row.get(4)?,
                click_position: row.get(5)?,
                session_id: row.get(6)?,
                user_id: row.get(7)?,
                searched_at: parse_ts(&searched_at),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // ============================================
    // Analytics aggregates
    // ============================================

    /// Queries grouped by text over a window, most frequent first.
    pub fn top_queries(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<QueryCount>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT query, COUNT(*) AS n FROM search_events
             WHERE searched_at >= ?1
             GROUP BY query ORDER BY n DESC, query ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339(), limit as i64], |row| {
            Ok(QueryCount {
                query: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Overall (searches, clicks) within a window.
    pub fn search_click_totals(&self, since: DateTime<Utc>) -> Result<(i64, i64)> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*), COUNT(clicked_plugin_id) FROM search_events WHERE searched_at >= ?",
            [since.to_rfc3339()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(Error::from)
    }

    /// Per-query (query, searches, clicks) for queries with enough volume.
    pub fn query_click_counts(
        &self,
        since: DateTime<Utc>,
        min_searches: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT query, COUNT(*) AS searches, COUNT(clicked_plugin_id) AS clicks
             FROM search_events
             WHERE searched_at >= ?1
             GROUP BY query
             HAVING searches >= ?2
             ORDER BY searches DESC, query ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![since.to_rfc3339(), min_searches, limit as i64],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Per-query counts for the current and previous week.
    pub fn weekly_query_counts(
        &self,
        this_week_start: DateTime<Utc>,
        last_week_start: DateTime<Utc>,
    ) -> Result<Vec<(String, i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT query,
                    SUM(CASE WHEN searched_at >= ?1 THEN 1 ELSE 0 END) AS this_week,
                    SUM(CASE WHEN searched_at >= ?2 AND searched_at < ?1 THEN 1 ELSE 0 END) AS last_week
             FROM search_events
             WHERE searched_at >= ?2
             GROUP BY query",
        )?;
        let rows = stmt.query_map(
            params![this_week_start.to_rfc3339(), last_week_start.to_rfc3339()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Funnel counts: (searches, with results, clicked, installed via search).
    pub fn funnel_counts(&self, since: DateTime<Utc>) -> Result<(i64, i64, i64, i64)> {
        let conn = self.conn.lock().unwrap();
        let cutoff = since.to_rfc3339();
        let (searches, with_results, clicked): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN results_count > 0 THEN 1 ELSE 0 END),
                    COUNT(clicked_plugin_id)
             FROM search_events WHERE searched_at >= ?",
            [&cutoff],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    row.get(2)?,
                ))
            },
        )?;
        let installed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM install_events WHERE source = ?1 AND installed_at >= ?2",
            params![INSTALL_SOURCE_SEARCH, cutoff],
            |r| r.get(0),
        )?;
        Ok((searches, with_results, clicked, installed))
    }

    /// Click counts grouped by result position.
    pub fn clicks_by_position(&self, since: DateTime<Utc>) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT click_position, COUNT(*) FROM search_events
             WHERE searched_at >= ? AND click_position IS NOT NULL
             GROUP BY click_position ORDER BY click_position",
        )?;
        let rows = stmt.query_map([since.to_rfc3339()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Per-user (searches, clicks) within a window.
    pub fn search_activity_by_user(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(String, i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, COUNT(*) AS searches, COUNT(clicked_plugin_id)
             FROM search_events
             WHERE searched_at >= ?1 AND user_id IS NOT NULL
             GROUP BY user_id ORDER BY searches DESC, user_id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339(), limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Install counts per user within a window.
    pub fn installs_by_user(&self, since: DateTime<Utc>) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, COUNT(*) FROM install_events
             WHERE installed_at >= ? AND user_id IS NOT NULL
             GROUP BY user_id",
        )?;
        let rows = stmt.query_map([since.to_rfc3339()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Install counts per category within a window.
    pub fn installs_by_category(&self, since: DateTime<Utc>) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT p.category, COUNT(*) AS n
             FROM install_events e
             JOIN plugins p ON p.id = e.plugin_id
             WHERE e.installed_at >= ?
             GROUP BY p.category ORDER BY n DESC, p.category ASC",
        )?;
        let rows = stmt.query_map([since.to_rfc3339()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Delete search events older than the cutoff; returns rows removed.
    pub fn delete_search_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM search_events WHERE searched_at < ?",
            [cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    // ============================================
    // Recommendation cache
    // ============================================

    /// Fetch a live cache entry and bump its hit counter.
    pub fn cache_get(&self, cache_key: &str) -> Result<Option<String>> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let results: Option<String> = conn
            .query_row(
                "SELECT results FROM recommendation_cache
                 WHERE cache_key = ?1 AND expires_at > ?2",
                params![cache_key, now],
                |r| r.get(0),
            )
            .optional()?;
        if results.is_some() {
            conn.execute(
                "UPDATE recommendation_cache SET hit_count = hit_count + 1 WHERE cache_key = ?",
                [cache_key],
            )?;
        }
        Ok(results)
    }

    /// Store (or refresh) a cache entry.
    pub fn cache_put(
        &self,
        cache_key: &str,
        kind: &str,
        context: &str,
        plugin_ids: &[String],
        results: &str,
        ttl_secs: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(ttl_secs);
        // Sorted pipe-delimited list makes invalidation an exact membership probe
        let mut ids = plugin_ids.to_vec();
        ids.sort();
        ids.dedup();
        let id_list = if ids.is_empty() {
            String::new()
        } else {
            format!("|{}|", ids.join("|"))
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO recommendation_cache
                 (cache_key, kind, context, context_plugin_ids, results, generated_at, expires_at, hit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
             ON CONFLICT(cache_key) DO UPDATE SET
                 context = excluded.context,
                 context_plugin_ids = excluded.context_plugin_ids,
                 results = excluded.results,
                 generated_at = excluded.generated_at,
                 expires_at = excluded.expires_at",
            params![
                cache_key,
                kind,
                context,
                id_list,
                results,
                now.to_rfc3339(),
                expires.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn cache_hit_count(&self, cache_key: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT hit_count FROM recommendation_cache WHERE cache_key = ?",
            [cache_key],
            |r| r.get(0),
        )
        .map_err(Error::from)
    }

    /// Expire every cache entry whose context references the plugin.
    pub fn invalidate_cache_for_plugin(&self, plugin_id: &str) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE recommendation_cache SET expires_at = ?1
             WHERE context_plugin_ids LIKE '%|' || ?2 || '|%'",
            params![now, plugin_id],
        )?;
        Ok(changed)
    }

    /// Remove entries past their expiry; returns rows removed.
    pub fn evict_expired_cache(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM recommendation_cache WHERE expires_at <= ?",
            [now],
        )?;
        Ok(deleted)
    }

    // ============================================
    // Categories
    // ============================================

    /// Category metadata with derived plugin counts.
    pub fn list_categories(&self) -> Result<Vec<CategoryInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.name, c.display_name, c.description, c.sort_order, c.is_active,
                    (SELECT COUNT(*) FROM plugins p
                     WHERE p.category = c.name AND p.is_deprecated = 0) AS plugin_count
             FROM categories c
             WHERE c.is_active = 1
             ORDER BY c.sort_order, c.name",
        )?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            Ok(CategoryInfo {
                category: name.parse().unwrap_or(Category::Tools),
                display_name: row.get(1)?,
                description: row.get(2)?,
                sort_order: row.get(3)?,
                is_active: row.get(4)?,
                plugin_count: row.get(5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // ============================================
    // Maintenance
    // ============================================

    /// Reclaim space and refresh internal statistics. Idempotent.
    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("INSERT INTO plugin_fts(plugin_fts) VALUES('optimize')", [])?;
        conn.execute_batch("PRAGMA optimize; ANALYZE;")?;
        conn.execute("VACUUM", [])?;
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn create_test_plugin(id: &str, name: &str) -> PluginRecord {
        let mut plugin = PluginRecord::new(id, name, Category::Agents);
        plugin.description = Some(format!("{} helper", name));
        plugin.keywords = Some("testing automation".to_string());
        plugin.tags = vec!["automation".to_string(), "testing".to_string()];
        plugin
    }

    #[test]
    fn test_plugin_upsert_preserves_tracked_stats() {
        let db = test_db();
        let mut plugin = create_test_plugin("p1", "auth-agent");
        db.upsert_plugin(&plugin).unwrap();

        db.increment_downloads("p1").unwrap();
        db.increment_downloads("p1").unwrap();
        db.apply_rating("p1", 4.0).unwrap();

        // Re-ingest the manifest with new content
        plugin.description = Some("rewritten description".to_string());
        db.upsert_plugin(&plugin).unwrap();

        let stored = db.get_plugin("p1").unwrap().unwrap();
        assert_eq!(stored.downloads, 2);
        assert_eq!(stored.rating, 4.0);
        assert_eq!(stored.rating_count, 1);
        assert_eq!(stored.description.as_deref(), Some("rewritten description"));
    }

    #[test]
    fn test_fulltext_candidates_and_filters() {
        let db = test_db();
        let mut a = create_test_plugin("p1", "auth-agent");
        a.description = Some("authentication helper".to_string());
        let mut b = create_test_plugin("p2", "logger");
        b.description = Some("logging helper".to_string());
        b.category = Category::Tools;
        db.upsert_plugin(&a).unwrap();
        db.upsert_plugin(&b).unwrap();

        let hits = db
            .fulltext_candidates("\"authentication\"", &SearchFilters::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].plugin.id, "p1");

        // category filter drops the only match
        let filters = SearchFilters {
            category: Some(Category::Tools),
            ..Default::default()
        };
        let hits = db.fulltext_candidates("\"authentication\"", &filters).unwrap();
        assert!(hits.is_empty());

        // deprecated plugins are hidden by the default filter
        let mut a_dep = a.clone();
        a_dep.is_deprecated = true;
        db.upsert_plugin(&a_dep).unwrap();
        let hits = db
            .fulltext_candidates("\"authentication\"", &SearchFilters::default())
            .unwrap();
        assert!(hits.is_empty());

        let filters = SearchFilters {
            exclude_deprecated: false,
            ..Default::default()
        };
        let hits = db.fulltext_candidates("\"authentication\"", &filters).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_tag_filter_matches_any() {
        let db = test_db();
        let mut a = create_test_plugin("p1", "auth-agent");
        a.tags = vec!["security".to_string()];
        let mut b = create_test_plugin("p2", "auth-middleware");
        b.tags = vec!["networking".to_string()];
        db.upsert_plugin(&a).unwrap();
        db.upsert_plugin(&b).unwrap();

        let filters = SearchFilters {
            tags: vec!["security".to_string(), "storage".to_string()],
            ..Default::default()
        };
        let hits = db.fulltext_candidates("\"auth\"", &filters).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].plugin.id, "p1");
    }

    #[test]
    fn test_rebuild_postings_invariants() {
        let db = test_db();
        db.upsert_plugin(&create_test_plugin("p1", "auth-agent")).unwrap();
        db.upsert_plugin(&create_test_plugin("p2", "logger")).unwrap();

        let postings = vec![
            TermPosting {
                term: "auth".to_string(),
                plugin_id: "p1".to_string(),
                field: PluginField::Name,
                term_frequency: 0.5,
                inverse_document_frequency: 0.0,
                tfidf_score: 0.0,
            },
            TermPosting {
                term: "logger".to_string(),
                plugin_id: "p2".to_string(),
                field: PluginField::Name,
                term_frequency: 1.0,
                inverse_document_frequency: 0.0,
                tfidf_score: 0.0,
            },
        ];
        db.rebuild_postings(None, &postings, "fp1").unwrap();

        // df = 1 of 2 docs, idf = ln(3/2) + 1
        let df = db.document_frequency("auth").unwrap().unwrap();
        assert_eq!(df.document_count, 1);
        assert_eq!(df.total_documents, 2);
        let expected_idf = (3.0f64 / 2.0).ln() + 1.0;
        assert!((df.idf_score - expected_idf).abs() < 1e-9);

        let rows = db.postings_for_plugin("p1").unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].tfidf_score - 0.5 * expected_idf).abs() < 1e-9);

        // rerunning with the same input yields the same rows
        db.rebuild_postings(None, &postings, "fp1").unwrap();
        let rows2 = db.postings_for_plugin("p1").unwrap();
        assert_eq!(rows, rows2);

        let stats = db.index_stats().unwrap();
        assert_eq!(stats.postings, 2);
        assert_eq!(stats.stopword_fingerprint.as_deref(), Some("fp1"));
    }

    #[test]
    fn test_reindex_queue_cleared_by_scope() {
        let db = test_db();
        db.upsert_plugin(&create_test_plugin("p1", "a")).unwrap();
        db.upsert_plugin(&create_test_plugin("p2", "b")).unwrap();
        db.enqueue_reindex("p1").unwrap();
        db.enqueue_reindex("p2").unwrap();

        let ids = vec!["p1".to_string()];
        db.rebuild_postings(Some(&ids), &[], "fp").unwrap();
        assert_eq!(db.queued_plugin_ids().unwrap(), vec!["p2".to_string()]);
    }

    #[test]
    fn test_install_and_uninstall_flow() {
        let db = test_db();
        db.upsert_plugin(&create_test_plugin("p1", "auth-agent")).unwrap();

        db.record_install("p1", Some("u1"), Some("1.0.0"), Some("search"))
            .unwrap();
        assert_eq!(db.get_plugin("p1").unwrap().unwrap().downloads, 1);
        assert_eq!(db.active_memberships().unwrap().len(), 1);

        assert!(db.record_uninstall("p1", Some("u1")).unwrap());
        assert!(db.active_memberships().unwrap().is_empty());
        // nothing left to close
        assert!(!db.record_uninstall("p1", Some("u1")).unwrap());

        assert!(matches!(
            db.record_install("ghost", None, None, None),
            Err(Error::PluginNotFound(_))
        ));
    }

    #[test]
    fn test_click_attaches_to_latest_unclicked_event() {
        let db = test_db();
        let filters = serde_json::json!({});
        db.insert_search_event("auth", &filters, 3, Some("s1"), None).unwrap();
        db.insert_search_event("auth", &filters, 3, Some("s1"), None).unwrap();

        assert!(db.record_click("auth", "p1", 1, Some("s1")).unwrap());
        let events = db.recent_search_events(10).unwrap();
        let clicked: Vec<_> = events.iter().filter(|e| e.clicked_plugin_id.is_some()).collect();
        assert_eq!(clicked.len(), 1);
        assert_eq!(clicked[0].click_position, Some(1));

        // no matching session: nothing is fabricated
        assert!(!db.record_click("auth", "p1", 1, Some("other")).unwrap());
        // unknown query: nothing is fabricated
        assert!(!db.record_click("nope", "p1", 1, None).unwrap());
    }

    #[test]
    fn test_search_gap_occurrence_counting() {
        let db = test_db();
        db.upsert_search_gap("nonsense-xyz").unwrap();
        db.upsert_search_gap("nonsense-xyz").unwrap();

        let gap = db.get_search_gap("nonsense-xyz").unwrap().unwrap();
        assert_eq!(gap.occurrence_count, 2);
        assert!(gap.first_seen <= gap.last_seen);
        assert_eq!(gap.status, GapStatus::Open);
    }

    #[test]
    fn test_cache_roundtrip_and_invalidation() {
        let db = test_db();
        let ids = vec!["p1".to_string(), "p2".to_string()];
        db.cache_put("k1", "personalized", "ctx", &ids, "[]", 3600).unwrap();

        assert_eq!(db.cache_get("k1").unwrap().as_deref(), Some("[]"));
        assert_eq!(db.cache_hit_count("k1").unwrap(), 1);

        // exact membership: "p" does not invalidate an entry holding "p1"
        assert_eq!(db.invalidate_cache_for_plugin("p").unwrap(), 0);
        assert_eq!(db.invalidate_cache_for_plugin("p1").unwrap(), 1);
        assert!(db.cache_get("k1").unwrap().is_none());

        assert_eq!(db.evict_expired_cache().unwrap(), 1);
    }

    #[test]
    fn test_relationship_replace_and_lookup() {
        let db = test_db();
        db.upsert_plugin(&create_test_plugin("a", "a")).unwrap();
        db.upsert_plugin(&create_test_plugin("b", "b")).unwrap();

        let rels = vec![PluginRelationship {
            plugin_a: "a".to_string(),
            plugin_b: "b".to_string(),
            co_install_count: 2,
            confidence: 2.0 / 3.0,
        }];
        db.replace_relationships(&rels).unwrap();

        // lookup works in both directions
        let rel = db.get_relationship("b", "a").unwrap().unwrap();
        assert_eq!(rel.co_install_count, 2);

        let touching = db.relationships_for(&["b".to_string()]).unwrap();
        assert_eq!(touching.len(), 1);
    }

    #[test]
    fn test_categories_with_counts() {
        let db = test_db();
        db.upsert_plugin(&create_test_plugin("p1", "a")).unwrap();
        let mut dep = create_test_plugin("p2", "b");
        dep.is_deprecated = true;
        db.upsert_plugin(&dep).unwrap();

        let categories = db.list_categories().unwrap();
        assert_eq!(categories.len(), 7);
        let agents = categories
            .iter()
            .find(|c| c.category == Category::Agents)
            .unwrap();
        // deprecated plugins do not count
        assert_eq!(agents.plugin_count, 1);
    }
}
