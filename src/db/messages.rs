//! Message repository.
//!
//! Messages are append-only: content never changes after insertion and rows
//! only disappear when their conversation does. `seq` is assigned here and is
//! strictly increasing per conversation; a UNIQUE violation means another
//! writer is on the store and surfaces as `DuplicateSeq`.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::database::Database;
use super::models::{Message, MessagePart, Role, StoredPart, ts_from_millis, ts_to_millis};
use crate::error::{LcmError, Result};
use crate::tokenizer::estimate_tokens;

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message with auto-assigned `seq`, inserting its parts in the
    /// same transaction.
    pub async fn append(
        &self,
        conversation_id: i64,
        role: Role,
        content: String,
        stop_reason: Option<String>,
        created_at: Option<DateTime<Utc>>,
        parts: Vec<MessagePart>,
    ) -> Result<Message> {
        self.db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let msg = insert_message_tx(
                    &tx,
                    conversation_id,
                    None,
                    role,
                    &content,
                    stop_reason.as_deref(),
                    created_at,
                )?;
                insert_parts_tx(&tx, msg.id, &parts)?;
                tx.commit()?;
                Ok(msg)
            })
            .await
    }

    /// Insert a transcript message with its original `seq` during bootstrap.
    pub async fn import(
        &self,
        conversation_id: i64,
        seq: i64,
        role: Role,
        content: String,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<Message> {
        self.db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let msg = insert_message_tx(
                    &tx,
                    conversation_id,
                    Some(seq),
                    role,
                    &content,
                    None,
                    created_at,
                )?;
                tx.commit()?;
                Ok(msg)
            })
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Message>> {
        self.db
            .interact(move |conn| {
                conn.query_row(
                    &format!("{MESSAGE_SELECT} WHERE id = ?1"),
                    [id],
                    map_message,
                )
                .optional()
                .map_err(LcmError::from)
            })
            .await
    }

    /// All messages of a conversation in `seq` order.
    pub async fn list(&self, conversation_id: i64) -> Result<Vec<Message>> {
        self.db
            .interact(move |conn| list_tx(conn, conversation_id))
            .await
    }

    /// Ordered parts of one message.
    pub async fn parts(&self, message_id: i64) -> Result<Vec<MessagePart>> {
        self.db
            .interact(move |conn| {
                Ok(parts_for_messages_tx(conn, &[message_id])?
                    .remove(&message_id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| p.part)
                    .collect())
            })
            .await
    }

    pub async fn max_seq(&self, conversation_id: i64) -> Result<i64> {
        self.db
            .interact(move |conn| max_seq_tx(conn, conversation_id))
            .await
    }

    /// `(seq, role, SHA-256(content))` for every stored message, used by
    /// bootstrap anchor matching.
    pub async fn identities(&self, conversation_id: i64) -> Result<HashMap<i64, (Role, [u8; 32])>> {
        self.db
            .interact(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT seq, role, content FROM messages
                     WHERE conversation_id = ?1 ORDER BY seq",
                )?;
                let mut out = HashMap::new();
                let rows = stmt.query_map([conversation_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                for row in rows {
                    let (seq, role, content) = row?;
                    out.insert(seq, (Role::parse(&role)?, content_hash(&content)));
                }
                Ok(out)
            })
            .await
    }
}

pub(crate) const MESSAGE_SELECT: &str =
    "SELECT id, conversation_id, seq, role, content, token_count, stop_reason, created_at
     FROM messages";

/// SHA-256 of a message body, for transcript anchor matching.
pub(crate) fn content_hash(content: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.finalize().into()
}

pub(crate) fn max_seq_tx(conn: &Connection, conversation_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )
    .map_err(LcmError::from)
}

/// Insert one message row plus its FTS shadow.
///
/// `seq = None` auto-assigns `max + 1`. An explicit `seq` must be strictly
/// greater than the current maximum; anything else is an out-of-order insert
/// and is refused.
pub(crate) fn insert_message_tx(
    conn: &Connection,
    conversation_id: i64,
    seq: Option<i64>,
    role: Role,
    content: &str,
    stop_reason: Option<&str>,
    created_at: Option<DateTime<Utc>>,
) -> Result<Message> {
    let max = max_seq_tx(conn, conversation_id)?;
    let seq = match seq {
        None => max + 1,
        Some(s) if s > max => s,
        Some(s) => {
            return Err(LcmError::Input(format!(
                "out-of-order message seq {s} (current max {max}) in conversation {conversation_id}"
            )));
        }
    };
    let token_count = estimate_tokens(content);
    let created_at = ts_to_millis(created_at.unwrap_or_else(Utc::now));

    let inserted = conn.execute(
        "INSERT INTO messages (conversation_id, seq, role, content, token_count, stop_reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            conversation_id,
            seq,
            role.as_str(),
            content,
            token_count,
            stop_reason,
            created_at
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(LcmError::DuplicateSeq {
                conversation_id,
                seq,
            });
        }
        Err(e) => return Err(e.into()),
    }
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO messages_fts (rowid, content) VALUES (?1, ?2)",
        params![id, content],
    )?;
    super::conversations::touch_tx(conn, conversation_id)?;

    Ok(Message {
        id,
        conversation_id,
        seq,
        role,
        content: content.to_string(),
        token_count,
        stop_reason: stop_reason.map(str::to_string),
        created_at: ts_from_millis(created_at),
    })
}

/// Bulk-insert ordered parts for a message. Ordinals start at 1.
pub(crate) fn insert_parts_tx(
    conn: &Connection,
    message_id: i64,
    parts: &[MessagePart],
) -> Result<()> {
    if parts.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "INSERT INTO message_parts (message_id, ordinal, kind, payload) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (i, part) in parts.iter().enumerate() {
        let payload = serde_json::to_string(part)?;
        stmt.execute(params![message_id, (i + 1) as i64, part.kind(), payload])?;
    }
    Ok(())
}

pub(crate) fn list_tx(conn: &Connection, conversation_id: i64) -> Result<Vec<Message>> {
    let mut stmt =
        conn.prepare(&format!("{MESSAGE_SELECT} WHERE conversation_id = ?1 ORDER BY seq"))?;
    let rows = stmt
        .query_map([conversation_id], map_message)?
        .collect::<std::result::Result<_, _>>()?;
    Ok(rows)
}

/// Fetch messages by id, returned in the order requested.
pub(crate) fn fetch_by_ids_tx(conn: &Connection, ids: &[i64]) -> Result<Vec<Message>> {
    let mut by_id = HashMap::new();
    let mut stmt = conn.prepare(&format!("{MESSAGE_SELECT} WHERE id = ?1"))?;
    for &id in ids {
        if let Some(msg) = stmt.query_row([id], map_message).optional()? {
            by_id.insert(id, msg);
        }
    }
    ids.iter()
        .map(|id| {
            by_id
                .remove(id)
                .ok_or_else(|| LcmError::NotFound(format!("message {id}")))
        })
        .collect()
}

/// Ordered parts for a set of messages, keyed by message id.
pub(crate) fn parts_for_messages_tx(
    conn: &Connection,
    message_ids: &[i64],
) -> Result<HashMap<i64, Vec<StoredPart>>> {
    let mut out: HashMap<i64, Vec<StoredPart>> = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT message_id, ordinal, payload FROM message_parts
         WHERE message_id = ?1 ORDER BY ordinal",
    )?;
    for &id in message_ids {
        let rows = stmt.query_map([id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (message_id, ordinal, payload) = row?;
            let part: MessagePart = serde_json::from_str(&payload)?;
            out.entry(message_id).or_default().push(StoredPart {
                message_id,
                ordinal,
                part,
            });
        }
    }
    Ok(out)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub(crate) fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        role: Role::parse(&role).unwrap_or(Role::User),
        content: row.get(4)?,
        token_count: row.get(5)?,
        stop_reason: row.get(6)?,
        created_at: ts_from_millis(row.get(7)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ConversationRepository;

    async fn setup() -> (MessageRepository, i64) {
        let db = Database::connect_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let (conv, _) = ConversationRepository::new(db.clone())
            .get_or_create("sess-msg")
            .await
            .unwrap();
        (MessageRepository::new(db), conv.id)
    }

    #[tokio::test]
    async fn test_seq_is_assigned_monotonically() {
        let (repo, conv) = setup().await;
        for expected in 1..=3 {
            let msg = repo
                .append(conv, Role::User, format!("m{expected}"), None, None, vec![])
                .await
                .unwrap();
            assert_eq!(msg.seq, expected);
        }
        assert_eq!(repo.max_seq(conv).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_token_count_is_estimated() {
        let (repo, conv) = setup().await;
        let msg = repo
            .append(conv, Role::User, "x".repeat(10), None, None, vec![])
            .await
            .unwrap();
        assert_eq!(msg.token_count, 3); // ceil(10 / 4)
    }

    #[tokio::test]
    async fn test_import_preserves_seq_and_rejects_out_of_order() {
        let (repo, conv) = setup().await;
        let msg = repo
            .import(conv, 7, Role::User, "imported".into(), None)
            .await
            .unwrap();
        assert_eq!(msg.seq, 7);

        let err = repo
            .import(conv, 3, Role::User, "stale".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LcmError::Input(_)));
    }

    #[tokio::test]
    async fn test_parts_round_trip_in_order() {
        let (repo, conv) = setup().await;
        let parts = vec![
            MessagePart::Text { text: "a".into() },
            MessagePart::ToolCall {
                id: "c1".into(),
                name: "grep".into(),
                input: serde_json::json!({"q": "x"}),
            },
        ];
        let msg = repo
            .append(conv, Role::Assistant, "a".into(), None, None, parts.clone())
            .await
            .unwrap();
        let loaded = repo.parts(msg.id).await.unwrap();
        assert_eq!(loaded, parts);
    }

    #[tokio::test]
    async fn test_messages_are_fts_indexed() {
        let (repo, conv) = setup().await;
        repo.append(conv, Role::User, "the zanzibar protocol".into(), None, None, vec![])
            .await
            .unwrap();
        let hits: i64 = repo
            .db
            .interact(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM messages_fts WHERE messages_fts MATCH 'zanzibar'",
                    [],
                    |row| row.get(0),
                )
                .map_err(LcmError::from)
            })
            .await
            .unwrap();
        assert_eq!(hits, 1);
    }
}
