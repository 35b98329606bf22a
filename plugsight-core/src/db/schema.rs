//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! Full-text search is backed by an FTS5 external-content table kept in sync
//! with `plugins` by triggers.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Corpus
    -- ============================================

    CREATE TABLE IF NOT EXISTS plugins (
        id               TEXT PRIMARY KEY,
        name             TEXT NOT NULL,
        version          TEXT,
        description      TEXT,
        author_name      TEXT,
        author_email     TEXT,
        license          TEXT,
        homepage         TEXT,
        repository       TEXT,
        category         TEXT NOT NULL,
        tags             JSON NOT NULL DEFAULT '[]',
        -- space-joined projections indexed by FTS instead of JSON punctuation
        tags_text        TEXT NOT NULL DEFAULT '',
        keywords         TEXT,
        -- name + description + keywords, rebuilt on every upsert
        search_keywords  TEXT NOT NULL DEFAULT '',
        readme           TEXT,
        downloads        INTEGER NOT NULL DEFAULT 0 CHECK (downloads >= 0),
        rating           REAL NOT NULL DEFAULT 0 CHECK (rating >= 0 AND rating <= 5),
        rating_count     INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL,
        published_at     DATETIME,
        last_modified_at DATETIME,
        is_featured      INTEGER NOT NULL DEFAULT 0,
        is_deprecated    INTEGER NOT NULL DEFAULT 0,
        metadata         JSON
    );

    CREATE INDEX IF NOT EXISTS idx_plugins_category ON plugins(category);
    CREATE INDEX IF NOT EXISTS idx_plugins_downloads ON plugins(downloads DESC);
    CREATE INDEX IF NOT EXISTS idx_plugins_updated ON plugins(updated_at DESC);
    CREATE INDEX IF NOT EXISTS idx_plugins_deprecated ON plugins(is_deprecated);
    CREATE INDEX IF NOT EXISTS idx_plugins_featured ON plugins(is_featured) WHERE is_featured = 1;

    -- FTS5 virtual table for full-text search
    CREATE VIRTUAL TABLE IF NOT EXISTS plugin_fts USING fts5(
        name,
        description,
        keywords,
        readme,
        tags,
        content='plugins',
        content_rowid='rowid'
    );

    -- Triggers to keep FTS in sync
    CREATE TRIGGER IF NOT EXISTS plugins_fts_ai AFTER INSERT ON plugins BEGIN
        INSERT INTO plugin_fts(rowid, name, description, keywords, readme, tags)
        VALUES (NEW.rowid, NEW.name, NEW.description, NEW.search_keywords, NEW.readme, NEW.tags_text);
    END;

    CREATE TRIGGER IF NOT EXISTS plugins_fts_ad AFTER DELETE ON plugins BEGIN
        INSERT INTO plugin_fts(plugin_fts, rowid, name, description, keywords, readme, tags)
        VALUES ('delete', OLD.rowid, OLD.name, OLD.description, OLD.search_keywords, OLD.readme, OLD.tags_text);
    END;

    CREATE TRIGGER IF NOT EXISTS plugins_fts_au AFTER UPDATE ON plugins BEGIN
        INSERT INTO plugin_fts(plugin_fts, rowid, name, description, keywords, readme, tags)
        VALUES ('delete', OLD.rowid, OLD.name, OLD.description, OLD.search_keywords, OLD.readme, OLD.tags_text);
        INSERT INTO plugin_fts(rowid, name, description, keywords, readme, tags)
        VALUES (NEW.rowid, NEW.name, NEW.description, NEW.search_keywords, NEW.readme, NEW.tags_text);
    END;

    -- ============================================
    -- Derived index tables (regenerable)
    -- ============================================

    CREATE TABLE IF NOT EXISTS term_postings (
        term                        TEXT NOT NULL,
        plugin_id                   TEXT NOT NULL REFERENCES plugins(id) ON DELETE CASCADE,
        field                       TEXT NOT NULL,
        term_frequency              REAL NOT NULL,
        inverse_document_frequency  REAL NOT NULL,
        tfidf_score                 REAL NOT NULL,
        PRIMARY KEY (term, plugin_id, field)
    );

    CREATE INDEX IF NOT EXISTS idx_postings_plugin ON term_postings(plugin_id);

    CREATE TABLE IF NOT EXISTS document_frequency (
        term            TEXT PRIMARY KEY,
        document_count  INTEGER NOT NULL,
        total_documents INTEGER NOT NULL,
        idf_score       REAL NOT NULL
    );

    CREATE TABLE IF NOT EXISTS plugin_relationships (
        plugin_a         TEXT NOT NULL,
        plugin_b         TEXT NOT NULL,
        co_install_count INTEGER NOT NULL CHECK (co_install_count >= 2),
        confidence       REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
        updated_at       DATETIME NOT NULL,
        PRIMARY KEY (plugin_a, plugin_b),
        CHECK (plugin_a < plugin_b)
    );

    CREATE INDEX IF NOT EXISTS idx_relationships_b ON plugin_relationships(plugin_b);

    CREATE TABLE IF NOT EXISTS trending_plugins (
        plugin_id      TEXT PRIMARY KEY REFERENCES plugins(id) ON DELETE CASCADE,
        installs_day   INTEGER NOT NULL,
        installs_week  INTEGER NOT NULL,
        installs_month INTEGER NOT NULL,
        velocity_score REAL NOT NULL,
        computed_at    DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_trending_velocity ON trending_plugins(velocity_score DESC);

    -- ============================================
    -- Usage events
    -- ============================================

    CREATE TABLE IF NOT EXISTS install_events (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        plugin_id      TEXT NOT NULL REFERENCES plugins(id),
        user_id        TEXT,
        version        TEXT,
        source         TEXT,
        installed_at   DATETIME NOT NULL,
        uninstalled_at DATETIME
    );

    CREATE INDEX IF NOT EXISTS idx_install_events_plugin ON install_events(plugin_id, installed_at);
    CREATE INDEX IF NOT EXISTS idx_install_events_ts ON install_events(installed_at);
    CREATE INDEX IF NOT EXISTS idx_install_events_user ON install_events(user_id);

    CREATE TABLE IF NOT EXISTS user_plugins (
        user_id      TEXT NOT NULL,
        plugin_id    TEXT NOT NULL REFERENCES plugins(id),
        installed_at DATETIME NOT NULL,
        is_active    INTEGER NOT NULL DEFAULT 1,
        UNIQUE(user_id, plugin_id)
    );

    CREATE INDEX IF NOT EXISTS idx_user_plugins_plugin ON user_plugins(plugin_id) WHERE is_active = 1;

    CREATE TABLE IF NOT EXISTS search_events (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        query             TEXT NOT NULL,
        filters           JSON,
        results_count     INTEGER NOT NULL,
        clicked_plugin_id TEXT,
        click_position    INTEGER CHECK (click_position IS NULL OR click_position >= 1),
        session_id        TEXT,
        user_id           TEXT,
        searched_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_search_events_query ON search_events(query);
    CREATE INDEX IF NOT EXISTS idx_search_events_ts ON search_events(searched_at);

    CREATE TABLE IF NOT EXISTS search_gaps (
        query            TEXT PRIMARY KEY,
        results_count    INTEGER NOT NULL DEFAULT 0,
        occurrence_count INTEGER NOT NULL DEFAULT 1,
        first_seen       DATETIME NOT NULL,
        last_seen        DATETIME NOT NULL,
        status           TEXT NOT NULL DEFAULT 'open'
    );

    -- ============================================
    -- Recommendation cache
    -- ============================================

    CREATE TABLE IF NOT EXISTS recommendation_cache (
        cache_key          TEXT PRIMARY KEY,
        kind               TEXT NOT NULL,
        context            JSON NOT NULL,
        -- pipe-delimited sorted id list, e.g. '|a|b|', for exact invalidation
        context_plugin_ids TEXT NOT NULL DEFAULT '',
        results            JSON NOT NULL,
        generated_at       DATETIME NOT NULL,
        expires_at         DATETIME NOT NULL,
        hit_count          INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_cache_expires ON recommendation_cache(expires_at);

    -- ============================================
    -- Category metadata
    -- ============================================

    CREATE TABLE IF NOT EXISTS categories (
        name         TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        description  TEXT,
        sort_order   INTEGER NOT NULL DEFAULT 0,
        is_active    INTEGER NOT NULL DEFAULT 1
    );

    INSERT OR IGNORE INTO categories (name, display_name, description, sort_order) VALUES
        ('agents',    'Agents',    'Autonomous agents and assistants',      1),
        ('skills',    'Skills',    'Reusable skill packs',                  2),
        ('commands',  'Commands',  'Slash commands and shortcuts',          3),
        ('workflows', 'Workflows', 'Multi-step workflow definitions',       4),
        ('hooks',     'Hooks',     'Lifecycle hooks and interceptors',      5),
        ('templates', 'Templates', 'Project and prompt templates',          6),
        ('tools',     'Tools',     'Tool integrations',                     7);
    "#,
    // Version 2: Incremental reindex queue and index metadata
    r#"
    -- Plugins awaiting a TF-IDF refresh after ingest
    CREATE TABLE IF NOT EXISTS reindex_queue (
        plugin_id TEXT PRIMARY KEY REFERENCES plugins(id) ON DELETE CASCADE,
        queued_at DATETIME NOT NULL
    );

    -- Key/value metadata about the index itself (stop-word fingerprint, etc.)
    CREATE TABLE IF NOT EXISTS index_meta (
        key        TEXT PRIMARY KEY,
        value      TEXT NOT NULL,
        updated_at DATETIME NOT NULL
    );
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run migrations twice - should be idempotent
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        // Check version
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "plugins",
            "term_postings",
            "document_frequency",
            "plugin_relationships",
            "trending_plugins",
            "install_events",
            "user_plugins",
            "search_events",
            "search_gaps",
            "recommendation_cache",
            "categories",
            "reindex_queue",
            "index_meta",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_categories_seeded() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM categories", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 7);
    }

    #[test]
    fn test_fts_triggers_track_plugins() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO plugins (id, name, description, category, search_keywords, created_at, updated_at)
             VALUES ('p1', 'auth-agent', 'authentication helper', 'agents', 'auth-agent authentication helper', '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM plugin_fts WHERE plugin_fts MATCH 'authentication'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        // update flows through the sync trigger
        conn.execute(
            "UPDATE plugins SET description = 'logging helper', search_keywords = 'auth-agent logging helper' WHERE id = 'p1'",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM plugin_fts WHERE plugin_fts MATCH 'authentication'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM plugin_fts WHERE plugin_fts MATCH 'logging'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_relationship_pair_order_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO plugin_relationships (plugin_a, plugin_b, co_install_count, confidence, updated_at)
             VALUES ('zeta', 'alpha', 3, 0.5, '2026-01-01T00:00:00+00:00')",
            [],
        );
        assert!(result.is_err(), "reversed pair order should violate CHECK");
    }
}
