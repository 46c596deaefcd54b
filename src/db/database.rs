//! Database connection management and schema migration.
//!
//! One embedded SQLite file holds all state. The DDL is idempotent and the
//! legacy-repair pass is safe to re-run, so `run_migrations` can be called on
//! every startup regardless of what version created the file.

use deadpool_sqlite::{Config as DbConfig, Pool, PoolConfig, Runtime};
use once_cell::sync::Lazy;
use rusqlite::Connection;
use rusqlite_migration::{M, Migrations};
use std::path::Path;
use std::time::Duration;

use crate::error::{LcmError, Result};

/// Base DDL. Everything is `IF NOT EXISTS` so legacy databases pass through
/// unchanged and get repaired column-by-column afterwards. FTS tables are
/// managed separately (see `ensure_fts`).
const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id              INTEGER PRIMARY KEY,
    session_id      TEXT NOT NULL UNIQUE,
    title           TEXT,
    bootstrapped_at INTEGER,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    seq             INTEGER NOT NULL,
    role            TEXT NOT NULL CHECK (role IN ('system','user','assistant','tool')),
    content         TEXT NOT NULL,
    token_count     INTEGER NOT NULL CHECK (token_count >= 0),
    stop_reason     TEXT,
    created_at      INTEGER NOT NULL,
    UNIQUE (conversation_id, seq)
);

CREATE TABLE IF NOT EXISTS message_parts (
    id         INTEGER PRIMARY KEY,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    ordinal    INTEGER NOT NULL,
    kind       TEXT NOT NULL,
    payload    TEXT NOT NULL,
    UNIQUE (message_id, ordinal)
);

CREATE TABLE IF NOT EXISTS summaries (
    id                         TEXT PRIMARY KEY,
    conversation_id            INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    kind                       TEXT NOT NULL CHECK (kind IN ('leaf','condensed')),
    depth                      INTEGER NOT NULL CHECK (depth >= 0),
    content                    TEXT NOT NULL,
    token_count                INTEGER NOT NULL CHECK (token_count >= 0),
    earliest_at                INTEGER,
    latest_at                  INTEGER,
    descendant_count           INTEGER NOT NULL DEFAULT 0,
    descendant_token_count     INTEGER NOT NULL DEFAULT 0,
    source_message_token_count INTEGER NOT NULL DEFAULT 0,
    file_ids                   TEXT NOT NULL DEFAULT '[]',
    created_at                 INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS summary_messages (
    summary_id TEXT NOT NULL REFERENCES summaries(id) ON DELETE CASCADE,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE RESTRICT,
    ordinal    INTEGER NOT NULL,
    PRIMARY KEY (summary_id, ordinal)
);

CREATE TABLE IF NOT EXISTS summary_parents (
    summary_id        TEXT NOT NULL REFERENCES summaries(id) ON DELETE CASCADE,
    parent_summary_id TEXT NOT NULL REFERENCES summaries(id),
    ordinal           INTEGER NOT NULL,
    PRIMARY KEY (summary_id, ordinal)
);

CREATE TABLE IF NOT EXISTS context_items (
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    ordinal         INTEGER NOT NULL,
    kind            TEXT NOT NULL CHECK (kind IN ('message','summary')),
    message_id      INTEGER REFERENCES messages(id) ON DELETE RESTRICT,
    summary_id      TEXT REFERENCES summaries(id),
    PRIMARY KEY (conversation_id, ordinal),
    CHECK ((kind = 'message') = (message_id IS NOT NULL)),
    CHECK ((kind = 'summary') = (summary_id IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS large_files (
    id                  TEXT PRIMARY KEY,
    conversation_id     INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    file_name           TEXT NOT NULL,
    mime_type           TEXT,
    byte_size           INTEGER NOT NULL,
    storage_uri         TEXT NOT NULL,
    exploration_summary TEXT,
    created_at          INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
    ON messages(conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_summaries_conversation_depth
    ON summaries(conversation_id, depth, created_at);
CREATE INDEX IF NOT EXISTS idx_summary_parents_parent
    ON summary_parents(parent_summary_id);
CREATE INDEX IF NOT EXISTS idx_summary_messages_message
    ON summary_messages(message_id);
CREATE INDEX IF NOT EXISTS idx_context_items_message
    ON context_items(message_id);
CREATE INDEX IF NOT EXISTS idx_large_files_conversation
    ON large_files(conversation_id);
"#;

static MIGRATIONS: Lazy<Migrations<'static>> =
    Lazy::new(|| Migrations::new(vec![M::up(SCHEMA_DDL)]));

/// Handle to the embedded store. Cheap to clone; all methods check a pooled
/// connection out per call.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
}

impl Database {
    /// Open (or create) the database file at `path`.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = DbConfig::new(path)
            .create_pool(Runtime::Tokio1)
            .map_err(|e| LcmError::Database(format!("failed to create pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Open an in-memory database. The pool is pinned to a single connection
    /// so every caller sees the same store.
    pub async fn connect_in_memory() -> Result<Self> {
        let mut cfg = DbConfig::new(":memory:");
        cfg.pool = Some(PoolConfig::new(1));
        let pool = cfg
            .create_pool(Runtime::Tokio1)
            .map_err(|e| LcmError::Database(format!("failed to create pool: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run a closure against a pooled connection on the blocking pool.
    /// Per-connection pragmas are (re)applied here; they are no-ops after the
    /// first call on a given connection.
    pub(crate) async fn interact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| LcmError::Database(format!("failed to get connection: {e}")))?;
        conn.interact(move |conn| {
            conn.pragma_update(None, "foreign_keys", true)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            f(conn)
        })
        .await
        .map_err(|e| LcmError::Database(format!("connection task failed: {e}")))?
    }

    /// Apply the schema and all forward-compat repairs. Safe to re-run.
    pub async fn run_migrations(&self) -> Result<()> {
        self.interact(|conn| {
            // journal_mode returns the resulting mode as a row.
            let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |row| {
                row.get::<_, String>(0)
            });
            MIGRATIONS
                .to_latest(conn)
                .map_err(|e| LcmError::Database(format!("migration failed: {e}")))?;
            repair_legacy(conn)?;
            ensure_fts(conn)?;
            tracing::debug!("database schema up to date");
            Ok(())
        })
        .await
    }
}

/// Forward-only repairs for databases written by older builds. Each step is
/// idempotent; anomalies are logged and corrected with safe defaults, never
/// fatal.
fn repair_legacy(conn: &Connection) -> Result<()> {
    // 1. Missing columns, added with sentinel defaults that mark rows as
    //    needing backfill.
    ensure_column(conn, "conversations", "bootstrapped_at", "INTEGER")?;
    let depth_added = ensure_column(
        conn,
        "summaries",
        "depth",
        "INTEGER NOT NULL DEFAULT -1",
    )?;
    ensure_column(conn, "summaries", "earliest_at", "INTEGER")?;
    ensure_column(conn, "summaries", "latest_at", "INTEGER")?;
    let desc_added = ensure_column(
        conn,
        "summaries",
        "descendant_count",
        "INTEGER NOT NULL DEFAULT -1",
    )?;
    ensure_column(
        conn,
        "summaries",
        "descendant_token_count",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    ensure_column(
        conn,
        "summaries",
        "source_message_token_count",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    ensure_column(conn, "summaries", "file_ids", "TEXT NOT NULL DEFAULT '[]'")?;

    if depth_added {
        backfill_depth(conn)?;
    }
    if desc_added {
        backfill_derived(conn)?;
    }
    Ok(())
}

/// Add a column if the table lacks it. Returns true when the column was added.
fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<_, _>>()?;
    if existing.iter().any(|c| c == column) {
        return Ok(false);
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    tracing::info!("migration: added column {table}.{column}");
    Ok(true)
}

/// Backfill `summaries.depth` for legacy rows (sentinel -1).
///
/// Leaves become 0. Condensed rows are assigned `1 + max(parent.depth)` in
/// repeated passes until no progress remains; whatever is left (missing
/// parents, residual cycles) collapses to depth 1.
fn backfill_depth(conn: &Connection) -> Result<()> {
    conn.execute("UPDATE summaries SET depth = 0 WHERE kind = 'leaf'", [])?;

    loop {
        let changed = conn.execute(
            "UPDATE summaries SET depth = 1 + (
                 SELECT MAX(p.depth)
                 FROM summary_parents sp
                 JOIN summaries p ON p.id = sp.parent_summary_id
                 WHERE sp.summary_id = summaries.id
             )
             WHERE kind = 'condensed'
               AND depth < 0
               AND EXISTS (
                 SELECT 1 FROM summary_parents sp WHERE sp.summary_id = summaries.id
               )
               AND NOT EXISTS (
                 SELECT 1
                 FROM summary_parents sp
                 JOIN summaries p ON p.id = sp.parent_summary_id
                 WHERE sp.summary_id = summaries.id AND p.depth < 0
               )",
            [],
        )?;
        if changed == 0 {
            break;
        }
    }

    let stragglers = conn.execute("UPDATE summaries SET depth = 1 WHERE depth < 0", [])?;
    if stragglers > 0 {
        tracing::warn!(
            "migration: {stragglers} summaries with missing parents or cycles collapsed to depth 1"
        );
    }
    Ok(())
}

/// Backfill time ranges, descendant counts and token aggregates, leaf-first
/// per conversation in `(depth asc, created_at asc)` order.
fn backfill_derived(conn: &Connection) -> Result<()> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM summaries
             WHERE descendant_count < 0
             ORDER BY conversation_id, depth ASC, created_at ASC",
        )?;
        stmt.query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?
    };

    for id in ids {
        let (kind, created_at): (String, i64) = conn.query_row(
            "SELECT kind, created_at FROM summaries WHERE id = ?1",
            [&id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if kind == "leaf" {
            let (earliest, latest, msg_tokens): (Option<i64>, Option<i64>, i64) = conn
                .query_row(
                    "SELECT MIN(m.created_at), MAX(m.created_at),
                            COALESCE(SUM(m.token_count), 0)
                     FROM summary_messages sm
                     JOIN messages m ON m.id = sm.message_id
                     WHERE sm.summary_id = ?1",
                    [&id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
            conn.execute(
                "UPDATE summaries
                 SET earliest_at = COALESCE(earliest_at, ?2, ?4),
                     latest_at = COALESCE(latest_at, ?3, ?4),
                     descendant_count = 0,
                     descendant_token_count = 0,
                     source_message_token_count = ?5
                 WHERE id = ?1",
                rusqlite::params![id, earliest, latest, created_at, msg_tokens],
            )?;
        } else {
            // Parents were processed first (depth ordering); cycle remnants
            // may still carry the sentinel, which MAX(…, 0) neutralizes.
            let row: (Option<i64>, Option<i64>, i64, i64, i64) = conn.query_row(
                "SELECT MIN(COALESCE(p.earliest_at, p.created_at)),
                        MAX(COALESCE(p.latest_at, p.created_at)),
                        COALESCE(SUM(MAX(p.descendant_count, 0) + 1), 0),
                        COALESCE(SUM(p.token_count + MAX(p.descendant_token_count, 0)), 0),
                        COALESCE(SUM(MAX(p.source_message_token_count, 0)), 0)
                 FROM summary_parents sp
                 JOIN summaries p ON p.id = sp.parent_summary_id
                 WHERE sp.summary_id = ?1",
                [&id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )?;
            conn.execute(
                "UPDATE summaries
                 SET earliest_at = COALESCE(earliest_at, ?2, ?6),
                     latest_at = COALESCE(latest_at, ?3, ?6),
                     descendant_count = ?4,
                     descendant_token_count = ?5,
                     source_message_token_count = ?7
                 WHERE id = ?1",
                rusqlite::params![id, row.0, row.1, row.2, row.3, created_at, row.4],
            )?;
        }
    }
    Ok(())
}

/// Create the contentless FTS tables, rebuilding any legacy external-content
/// (`content_rowid=`) form from the base tables.
fn ensure_fts(conn: &Connection) -> Result<()> {
    ensure_fts_table(
        conn,
        "messages_fts",
        "INSERT INTO messages_fts(rowid, content) SELECT id, content FROM messages",
    )?;
    ensure_fts_table(
        conn,
        "summaries_fts",
        "INSERT INTO summaries_fts(rowid, content) SELECT rowid, content FROM summaries",
    )?;
    Ok(())
}

fn ensure_fts_table(conn: &Connection, name: &str, populate_sql: &str) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        Some(sql) if sql.contains("content_rowid") => {
            tracing::warn!("migration: rebuilding legacy external-content FTS table {name}");
            conn.execute_batch(&format!("DROP TABLE {name}"))?;
            create_fts_table(conn, name)?;
            conn.execute_batch(populate_sql)?;
        }
        Some(_) => {}
        None => {
            create_fts_table(conn, name)?;
            conn.execute_batch(populate_sql)?;
        }
    }
    Ok(())
}

fn create_fts_table(conn: &Connection, name: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE {name} USING fts5(
             content,
             content='',
             contentless_delete=1,
             tokenize='porter unicode61'
         )"
    ))?;
    Ok(())
}
