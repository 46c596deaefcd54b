//! Large-file metadata repository.
//!
//! Holds the sidecar records for payloads too big to keep inline. The bytes
//! live on disk under the configured root; only metadata and the exploration
//! blurb are queryable.

use rusqlite::{Connection, OptionalExtension, params};

use super::database::Database;
use super::models::{LargeFile, ts_from_millis, ts_to_millis};
use crate::error::{LcmError, Result};

#[derive(Clone)]
pub struct LargeFileRepository {
    db: Database,
}

impl LargeFileRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, file: LargeFile) -> Result<()> {
        self.db
            .interact(move |conn| insert_tx(conn, &file))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<LargeFile>> {
        let id = id.to_string();
        self.db.interact(move |conn| get_tx(conn, &id)).await
    }

    pub async fn list(&self, conversation_id: i64) -> Result<Vec<LargeFile>> {
        self.db
            .interact(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{LARGE_FILE_SELECT} WHERE conversation_id = ?1 ORDER BY created_at"
                ))?;
                let rows = stmt
                    .query_map([conversation_id], map_large_file)?
                    .collect::<std::result::Result<_, _>>()?;
                Ok(rows)
            })
            .await
    }
}

pub(crate) const LARGE_FILE_SELECT: &str =
    "SELECT id, conversation_id, file_name, mime_type, byte_size, storage_uri,
            exploration_summary, created_at
     FROM large_files";

pub(crate) fn insert_tx(conn: &Connection, file: &LargeFile) -> Result<()> {
    conn.execute(
        "INSERT INTO large_files (
             id, conversation_id, file_name, mime_type, byte_size, storage_uri,
             exploration_summary, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            file.id,
            file.conversation_id,
            file.file_name,
            file.mime_type,
            file.byte_size,
            file.storage_uri,
            file.exploration_summary,
            ts_to_millis(file.created_at)
        ],
    )?;
    Ok(())
}

pub(crate) fn get_tx(conn: &Connection, id: &str) -> Result<Option<LargeFile>> {
    conn.query_row(
        &format!("{LARGE_FILE_SELECT} WHERE id = ?1"),
        [id],
        map_large_file,
    )
    .optional()
    .map_err(LcmError::from)
}

fn map_large_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<LargeFile> {
    Ok(LargeFile {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        file_name: row.get(2)?,
        mime_type: row.get(3)?,
        byte_size: row.get(4)?,
        storage_uri: row.get(5)?,
        exploration_summary: row.get(6)?,
        created_at: ts_from_millis(row.get(7)?),
    })
}
