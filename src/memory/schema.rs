//! SQLite schema and migrations for the durable tiers.
//!
//! Episodic, semantic and persistent memory each own a separate database;
//! [`initialize_schema`] creates the tables for the given stage.

use rusqlite::{Connection, Result as SqliteResult};

use crate::memory::types::Stage;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema for a tier.
pub fn initialize_schema(conn: &Connection, stage: Stage) -> SqliteResult<()> {
    // WAL keeps readers unblocked while a version append commits
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        match stage {
            Stage::Episodic => apply_v1_episodic(conn)?,
            Stage::Semantic => apply_v1_semantic(conn)?,
            Stage::Persistent => apply_v1_persistent(conn)?,
            // Working memory never touches SQLite
            Stage::Working => return Ok(()),
        }
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

fn apply_v1_episodic(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS episodes (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            content_text TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            metadata_text TEXT NOT NULL DEFAULT '',
            importance REAL NOT NULL DEFAULT 0.0,
            timestamp TEXT NOT NULL,
            last_accessed TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0,
            valence REAL,
            arousal REAL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_episodes_timestamp ON episodes(timestamp)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_episodes_valence ON episodes(valence)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_episodes_arousal ON episodes(arousal)",
        [],
    )?;
    Ok(())
}

fn apply_v1_semantic(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS semantic_entries (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            importance REAL NOT NULL DEFAULT 0.0,
            timestamp TEXT NOT NULL,
            last_accessed TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0,
            embedding BLOB NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS semantic_concepts (
            entry_id TEXT NOT NULL,
            concept TEXT NOT NULL,
            PRIMARY KEY (entry_id, concept),
            FOREIGN KEY (entry_id) REFERENCES semantic_entries(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semantic_concepts_concept ON semantic_concepts(concept)",
        [],
    )?;
    Ok(())
}

fn apply_v1_persistent(conn: &Connection) -> SqliteResult<()> {
    // Append-only: rows are inserted, never updated
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entry_versions (
            id TEXT NOT NULL,
            version INTEGER NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            importance REAL NOT NULL DEFAULT 0.0,
            timestamp TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            PRIMARY KEY (id, version)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entry_access (
            id TEXT PRIMARY KEY,
            last_accessed TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema for a tier is initialized.
pub fn is_initialized(conn: &Connection, stage: Stage) -> bool {
    let table = match stage {
        Stage::Episodic => "episodes",
        Stage::Semantic => "semantic_entries",
        Stage::Persistent => "entry_versions",
        Stage::Working => return true,
    };
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
