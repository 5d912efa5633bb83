//! Database Migrations
//!
//! Schema migration definitions for the storage layer.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: engrams, FTS5 content index, helpfulness",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Supersession audit log",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS engrams (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'fact',

    -- Decay model
    importance REAL NOT NULL DEFAULT 0.5,
    protected INTEGER NOT NULL DEFAULT 0,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT,
    decay_rate REAL NOT NULL DEFAULT 0.005,

    -- Embeddings: f32 source of truth + i8 ranking form, both or neither
    embedding_f32 BLOB,
    embedding_i8 BLOB,

    -- Supersession chain links
    supersedes_id INTEGER REFERENCES engrams(id),
    superseded_at TEXT,
    supersession_type TEXT,

    -- Valid-time window (half-open)
    valid_from TEXT,
    valid_until TEXT,
    validity_source TEXT,

    inserted_at TEXT NOT NULL,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_engrams_category ON engrams(category);
CREATE INDEX IF NOT EXISTS idx_engrams_supersedes ON engrams(supersedes_id);
CREATE INDEX IF NOT EXISTS idx_engrams_superseded_at ON engrams(superseded_at);
CREATE INDEX IF NOT EXISTS idx_engrams_validity ON engrams(valid_from, valid_until);
CREATE INDEX IF NOT EXISTS idx_engrams_inserted_at ON engrams(inserted_at);
CREATE INDEX IF NOT EXISTS idx_engrams_importance ON engrams(importance);

-- FTS5 virtual table for lexical candidate fetch
CREATE VIRTUAL TABLE IF NOT EXISTS engrams_fts USING fts5(
    content,
    content='engrams',
    content_rowid='id'
);

-- Triggers to keep FTS in sync
CREATE TRIGGER IF NOT EXISTS engrams_ai AFTER INSERT ON engrams BEGIN
    INSERT INTO engrams_fts(rowid, content) VALUES (NEW.id, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS engrams_ad AFTER DELETE ON engrams BEGIN
    INSERT INTO engrams_fts(engrams_fts, rowid, content)
    VALUES ('delete', OLD.id, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS engrams_au AFTER UPDATE OF content ON engrams BEGIN
    INSERT INTO engrams_fts(engrams_fts, rowid, content)
    VALUES ('delete', OLD.id, OLD.content);
    INSERT INTO engrams_fts(rowid, content) VALUES (NEW.id, NEW.content);
END;

-- Aggregated helpfulness signals per engram
CREATE TABLE IF NOT EXISTS helpfulness (
    engram_id INTEGER PRIMARY KEY,
    positive INTEGER NOT NULL DEFAULT 0,
    negative INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_helpfulness_updated ON helpfulness(updated_at);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Supersession audit log
///
/// Every supersession write lands here in the same transaction, giving crash
/// recovery a replay source and audits a history that survives pruning.
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS supersession_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    engram_id INTEGER NOT NULL,
    successor_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_supersession_log_engram ON supersession_log(engram_id);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );

            // execute_batch handles multi-statement SQL including triggers
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
