//! Conversation repository.
//!
//! Conversations are keyed externally by `session_id` and created lazily on
//! first ingest. Deleting one removes every owned row in dependency order so
//! the RESTRICT protection on message references never fires mid-cascade.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::database::Database;
use super::models::{Conversation, ts_from_millis, ts_to_millis};
use crate::error::{LcmError, Result};

#[derive(Clone)]
pub struct ConversationRepository {
    db: Database,
}

impl ConversationRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch the conversation for `session_id`, creating it if absent.
    /// Returns the row and whether it was created by this call.
    pub async fn get_or_create(&self, session_id: &str) -> Result<(Conversation, bool)> {
        let session_id = session_id.to_string();
        self.db
            .interact(move |conn| get_or_create_tx(conn, &session_id))
            .await
    }

    pub async fn get_by_session(&self, session_id: &str) -> Result<Option<Conversation>> {
        let session_id = session_id.to_string();
        self.db
            .interact(move |conn| get_by_session_tx(conn, &session_id))
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Conversation>> {
        self.db
            .interact(move |conn| {
                conn.query_row(
                    "SELECT id, session_id, title, bootstrapped_at, created_at, updated_at
                     FROM conversations WHERE id = ?1",
                    [id],
                    map_conversation,
                )
                .optional()
                .map_err(LcmError::from)
            })
            .await
    }

    pub async fn set_title(&self, id: i64, title: &str) -> Result<()> {
        let title = title.to_string();
        self.db
            .interact(move |conn| {
                conn.execute(
                    "UPDATE conversations SET title = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, title, ts_to_millis(Utc::now())],
                )?;
                Ok(())
            })
            .await
    }

    /// Stamp `bootstrapped_at` after a successful transcript reconciliation.
    pub async fn mark_bootstrapped(&self, id: i64) -> Result<()> {
        self.db
            .interact(move |conn| {
                let now = ts_to_millis(Utc::now());
                conn.execute(
                    "UPDATE conversations SET bootstrapped_at = ?2, updated_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Delete a conversation and everything it owns.
    pub async fn delete(&self, id: i64) -> Result<()> {
        self.db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                // FTS rows first (contentless tables do not cascade), then
                // children in reference order, RESTRICT targets last.
                tx.execute(
                    "DELETE FROM messages_fts WHERE rowid IN
                     (SELECT id FROM messages WHERE conversation_id = ?1)",
                    [id],
                )?;
                tx.execute(
                    "DELETE FROM summaries_fts WHERE rowid IN
                     (SELECT rowid FROM summaries WHERE conversation_id = ?1)",
                    [id],
                )?;
                tx.execute("DELETE FROM context_items WHERE conversation_id = ?1", [id])?;
                tx.execute(
                    "DELETE FROM summary_messages WHERE summary_id IN
                     (SELECT id FROM summaries WHERE conversation_id = ?1)",
                    [id],
                )?;
                tx.execute(
                    "DELETE FROM summary_parents WHERE summary_id IN
                     (SELECT id FROM summaries WHERE conversation_id = ?1)",
                    [id],
                )?;
                tx.execute("DELETE FROM summaries WHERE conversation_id = ?1", [id])?;
                tx.execute(
                    "DELETE FROM message_parts WHERE message_id IN
                     (SELECT id FROM messages WHERE conversation_id = ?1)",
                    [id],
                )?;
                tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [id])?;
                tx.execute("DELETE FROM large_files WHERE conversation_id = ?1", [id])?;
                let removed = tx.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
                tx.commit()?;
                if removed > 0 {
                    tracing::info!("deleted conversation {id} and all owned rows");
                }
                Ok(())
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Conversation>> {
        self.db
            .interact(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, title, bootstrapped_at, created_at, updated_at
                     FROM conversations ORDER BY updated_at DESC",
                )?;
                let rows = stmt
                    .query_map([], map_conversation)?
                    .collect::<std::result::Result<_, _>>()?;
                Ok(rows)
            })
            .await
    }
}

pub(crate) fn get_or_create_tx(conn: &Connection, session_id: &str) -> Result<(Conversation, bool)> {
    if let Some(existing) = get_by_session_tx(conn, session_id)? {
        return Ok((existing, false));
    }
    let now = ts_to_millis(Utc::now());
    conn.execute(
        "INSERT INTO conversations (session_id, created_at, updated_at) VALUES (?1, ?2, ?2)",
        params![session_id, now],
    )?;
    let id = conn.last_insert_rowid();
    tracing::debug!("created conversation {id} for session {session_id}");
    Ok((
        Conversation {
            id,
            session_id: session_id.to_string(),
            title: None,
            bootstrapped_at: None,
            created_at: ts_from_millis(now),
            updated_at: ts_from_millis(now),
        },
        true,
    ))
}

pub(crate) fn get_by_session_tx(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT id, session_id, title, bootstrapped_at, created_at, updated_at
         FROM conversations WHERE session_id = ?1",
        [session_id],
        map_conversation,
    )
    .optional()
    .map_err(LcmError::from)
}

pub(crate) fn touch_tx(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
        params![id, ts_to_millis(Utc::now())],
    )?;
    Ok(())
}

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        title: row.get(2)?,
        bootstrapped_at: row.get::<_, Option<i64>>(3)?.map(ts_from_millis),
        created_at: ts_from_millis(row.get(4)?),
        updated_at: ts_from_millis(row.get(5)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> ConversationRepository {
        let db = Database::connect_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        ConversationRepository::new(db)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let repo = repo().await;
        let (first, created) = repo.get_or_create("sess-1").await.unwrap();
        assert!(created);
        let (second, created) = repo.get_or_create("sess-1").await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_distinct_sessions_get_distinct_conversations() {
        let repo = repo().await;
        let (a, _) = repo.get_or_create("sess-a").await.unwrap();
        let (b, _) = repo.get_or_create("sess-b").await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_mark_bootstrapped() {
        let repo = repo().await;
        let (conv, _) = repo.get_or_create("sess-boot").await.unwrap();
        assert!(conv.bootstrapped_at.is_none());
        repo.mark_bootstrapped(conv.id).await.unwrap();
        let reloaded = repo.get(conv.id).await.unwrap().unwrap();
        assert!(reloaded.bootstrapped_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_unknown_conversation_is_noop() {
        let repo = repo().await;
        repo.delete(9999).await.unwrap();
    }
}
