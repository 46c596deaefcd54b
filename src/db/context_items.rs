//! Context item sequencer.
//!
//! The ordered `(conversation_id, ordinal)` stream of message and summary
//! references that represents the model-visible context. Ordinals are dense
//! from 1 and are renumbered whenever a range is replaced; range replacement
//! is the only operation that removes message references from the stream.

use rusqlite::{Connection, params};

use super::database::Database;
use super::models::{ContextItem, ContextItemKind, SequencedItem, ts_from_millis};
use crate::error::{LcmError, Result};

#[derive(Clone)]
pub struct ContextItemRepository {
    db: Database,
}

impl ContextItemRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message reference at the next ordinal.
    pub async fn append_message(&self, conversation_id: i64, message_id: i64) -> Result<i64> {
        self.db
            .interact(move |conn| append_message_tx(conn, conversation_id, message_id))
            .await
    }

    /// Atomically replace `[start_ordinal, end_ordinal]` with a single
    /// summary item and renumber the tail to keep ordinals dense.
    pub async fn replace_range(
        &self,
        conversation_id: i64,
        start_ordinal: i64,
        end_ordinal: i64,
        summary_id: String,
    ) -> Result<()> {
        self.db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                replace_range_tx(&tx, conversation_id, start_ordinal, end_ordinal, &summary_id)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Dense ordered view of the stream.
    pub async fn list(&self, conversation_id: i64) -> Result<Vec<ContextItem>> {
        self.db
            .interact(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT conversation_id, ordinal, kind, message_id, summary_id
                     FROM context_items WHERE conversation_id = ?1 ORDER BY ordinal",
                )?;
                let rows = stmt
                    .query_map([conversation_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|(conversation_id, ordinal, kind, message_id, summary_id)| {
                        Ok(ContextItem {
                            conversation_id,
                            ordinal,
                            kind: ContextItemKind::parse(&kind)?,
                            message_id,
                            summary_id,
                        })
                    })
                    .collect()
            })
            .await
    }

    /// Stream items joined with token counts, timestamps and summary depth —
    /// the view the compaction engine and assembler scan.
    pub async fn list_sequenced(&self, conversation_id: i64) -> Result<Vec<SequencedItem>> {
        self.db
            .interact(move |conn| list_sequenced_tx(conn, conversation_id))
            .await
    }

    /// Total estimated tokens across the stream.
    pub async fn total_tokens(&self, conversation_id: i64) -> Result<i64> {
        self.db
            .interact(move |conn| total_tokens_tx(conn, conversation_id))
            .await
    }
}

pub(crate) fn append_message_tx(
    conn: &Connection,
    conversation_id: i64,
    message_id: i64,
) -> Result<i64> {
    let ordinal: i64 = conn.query_row(
        "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM context_items WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO context_items (conversation_id, ordinal, kind, message_id)
         VALUES (?1, ?2, 'message', ?3)",
        params![conversation_id, ordinal, message_id],
    )?;
    Ok(ordinal)
}

/// Delete `[start, end]`, insert the summary at `start`, close the gap.
///
/// The tail shift goes through negative ordinals first so the
/// `(conversation_id, ordinal)` primary key never sees a transient collision
/// regardless of the order SQLite visits rows.
pub(crate) fn replace_range_tx(
    conn: &Connection,
    conversation_id: i64,
    start_ordinal: i64,
    end_ordinal: i64,
    summary_id: &str,
) -> Result<()> {
    if start_ordinal < 1 || end_ordinal < start_ordinal {
        return Err(LcmError::Input(format!(
            "invalid replace range [{start_ordinal}, {end_ordinal}]"
        )));
    }
    let removed = conn.execute(
        "DELETE FROM context_items
         WHERE conversation_id = ?1 AND ordinal BETWEEN ?2 AND ?3",
        params![conversation_id, start_ordinal, end_ordinal],
    )?;
    if removed as i64 != end_ordinal - start_ordinal + 1 {
        return Err(LcmError::Invariant(format!(
            "replace range [{start_ordinal}, {end_ordinal}] covered {removed} items; \
             the stream is not dense"
        )));
    }
    conn.execute(
        "INSERT INTO context_items (conversation_id, ordinal, kind, summary_id)
         VALUES (?1, ?2, 'summary', ?3)",
        params![conversation_id, start_ordinal, summary_id],
    )?;

    let shift = end_ordinal - start_ordinal;
    if shift > 0 {
        conn.execute(
            "UPDATE context_items SET ordinal = -(ordinal - ?3)
             WHERE conversation_id = ?1 AND ordinal > ?2",
            params![conversation_id, end_ordinal, shift],
        )?;
        conn.execute(
            "UPDATE context_items SET ordinal = -ordinal
             WHERE conversation_id = ?1 AND ordinal < 0",
            [conversation_id],
        )?;
    }
    Ok(())
}

pub(crate) fn list_sequenced_tx(
    conn: &Connection,
    conversation_id: i64,
) -> Result<Vec<SequencedItem>> {
    let mut stmt = conn.prepare(
        "SELECT ci.ordinal, ci.kind, ci.message_id, ci.summary_id,
                COALESCE(m.token_count, s.token_count, 0),
                COALESCE(m.created_at, s.created_at, 0),
                s.depth
         FROM context_items ci
         LEFT JOIN messages m ON m.id = ci.message_id
         LEFT JOIN summaries s ON s.id = ci.summary_id
         WHERE ci.conversation_id = ?1
         ORDER BY ci.ordinal",
    )?;
    let rows = stmt
        .query_map([conversation_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<i64>>(6)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(
            |(ordinal, kind, message_id, summary_id, token_count, created_at, depth)| {
                Ok(SequencedItem {
                    ordinal,
                    kind: ContextItemKind::parse(&kind)?,
                    message_id,
                    summary_id,
                    token_count,
                    created_at: ts_from_millis(created_at),
                    depth,
                })
            },
        )
        .collect()
}

pub(crate) fn total_tokens_tx(conn: &Connection, conversation_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(COALESCE(m.token_count, s.token_count, 0)), 0)
         FROM context_items ci
         LEFT JOIN messages m ON m.id = ci.message_id
         LEFT JOIN summaries s ON s.id = ci.summary_id
         WHERE ci.conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )
    .map_err(LcmError::from)
}
