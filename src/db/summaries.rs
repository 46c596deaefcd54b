//! Summary DAG repository.
//!
//! Summaries form a per-conversation DAG: leaves point at messages through
//! `summary_messages`, condensed nodes point at other summaries through
//! `summary_parents`. Derived metadata (depth, time range, descendant counts,
//! token aggregates) is computed from the sources at insert time and never
//! recomputed afterwards.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::database::Database;
use super::messages;
use super::models::{MessagePart, Summary, SummaryKind, ts_from_millis, ts_to_millis};
use crate::error::{LcmError, Result};
use crate::tokenizer::estimate_tokens;

/// Ordered source set for a new summary: message ids for a leaf, parent
/// summary ids for a condensed node.
#[derive(Debug, Clone)]
pub enum SummarySources {
    Messages(Vec<i64>),
    Parents(Vec<String>),
}

/// Creation request for one summary node.
#[derive(Debug, Clone)]
pub struct NewSummary {
    pub conversation_id: i64,
    pub content: String,
    pub sources: SummarySources,
}

/// One node of a DFS subtree walk.
#[derive(Debug, Clone)]
pub struct SubtreeEntry {
    pub summary: Summary,
    pub depth_from_root: usize,
    /// Summary ids from the root down to (and including) this node.
    pub path: Vec<String>,
    /// Number of nodes this one was built from (its subtree children).
    pub child_count: usize,
}

#[derive(Clone)]
pub struct SummaryRepository {
    db: Database,
}

impl SummaryRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a summary node with its edges and FTS row in one transaction.
    pub async fn create(&self, new: NewSummary) -> Result<Summary> {
        self.db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let summary = create_tx(&tx, &new)?;
                tx.commit()?;
                Ok(summary)
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Summary>> {
        let id = id.to_string();
        self.db.interact(move |conn| get_tx(conn, &id)).await
    }

    /// Immediate parents of a condensed node, in edge order.
    pub async fn parents(&self, id: &str) -> Result<Vec<Summary>> {
        let id = id.to_string();
        self.db.interact(move |conn| parents_tx(conn, &id)).await
    }

    /// Summaries that were condensed from this node.
    pub async fn children(&self, id: &str) -> Result<Vec<Summary>> {
        let id = id.to_string();
        self.db.interact(move |conn| children_tx(conn, &id)).await
    }

    /// DFS walk of the subtree rooted at `id` (root excluded), cycle-safe.
    pub async fn subtree(&self, id: &str, max_depth: Option<usize>) -> Result<Vec<SubtreeEntry>> {
        let id = id.to_string();
        self.db
            .interact(move |conn| subtree_tx(conn, &id, max_depth))
            .await
    }

    /// Message ids feeding this summary. Leaves resolve directly; condensed
    /// nodes recurse through parents, capped at `max_depth` levels.
    pub async fn source_messages(&self, id: &str, max_depth: usize) -> Result<Vec<i64>> {
        let id = id.to_string();
        self.db
            .interact(move |conn| source_messages_tx(conn, &id, max_depth))
            .await
    }
}

/// Generate `sum_` + 16 lowercase hex chars from content plus the creation
/// instant, so identical content minted twice still gets distinct ids.
pub(crate) fn generate_summary_id(content: &str, now_ns: i128) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(now_ns.to_le_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("sum_{hex}")
}

pub(crate) fn create_tx(conn: &Connection, new: &NewSummary) -> Result<Summary> {
    let now = Utc::now();
    let now_ms = ts_to_millis(now);
    let now_ns = now.timestamp_nanos_opt().map(i128::from).unwrap_or_else(|| {
        i128::from(now.timestamp_millis()) * 1_000_000
    });

    let (kind, depth, earliest, latest, descendant_count, descendant_tokens, source_msg_tokens, file_ids) =
        match &new.sources {
            SummarySources::Messages(ids) => {
                if ids.is_empty() {
                    return Err(LcmError::Invariant(
                        "leaf summary requires at least one source message".into(),
                    ));
                }
                let msgs = messages::fetch_by_ids_tx(conn, ids)?;
                for m in &msgs {
                    if m.conversation_id != new.conversation_id {
                        return Err(LcmError::Invariant(format!(
                            "source message {} belongs to conversation {}, not {}",
                            m.id, m.conversation_id, new.conversation_id
                        )));
                    }
                }
                let earliest = msgs.iter().map(|m| m.created_at).min().unwrap_or(now);
                let latest = msgs.iter().map(|m| m.created_at).max().unwrap_or(now);
                let msg_tokens: i64 = msgs.iter().map(|m| m.token_count).sum();
                let file_ids = file_ids_of_messages(conn, ids)?;
                (
                    SummaryKind::Leaf,
                    0i64,
                    earliest,
                    latest,
                    0i64,
                    0i64,
                    msg_tokens,
                    file_ids,
                )
            }
            SummarySources::Parents(ids) => {
                if ids.is_empty() {
                    return Err(LcmError::Invariant(
                        "condensed summary requires at least one parent".into(),
                    ));
                }
                let mut parents = Vec::with_capacity(ids.len());
                for pid in ids {
                    let parent = get_tx(conn, pid)?
                        .ok_or_else(|| LcmError::NotFound(format!("parent summary {pid}")))?;
                    if parent.conversation_id != new.conversation_id {
                        return Err(LcmError::Invariant(format!(
                            "parent summary {pid} belongs to conversation {}, not {}",
                            parent.conversation_id, new.conversation_id
                        )));
                    }
                    parents.push(parent);
                }
                let depth = 1 + parents.iter().map(|p| p.depth).max().unwrap_or(0);
                let earliest = parents
                    .iter()
                    .map(Summary::earliest_or_created)
                    .min()
                    .unwrap_or(now);
                let latest = parents
                    .iter()
                    .map(Summary::latest_or_created)
                    .max()
                    .unwrap_or(now);
                let descendant_count: i64 =
                    parents.iter().map(|p| p.descendant_count + 1).sum();
                let descendant_tokens: i64 = parents
                    .iter()
                    .map(|p| p.token_count + p.descendant_token_count)
                    .sum();
                let source_msg_tokens: i64 =
                    parents.iter().map(|p| p.source_message_token_count).sum();
                let mut file_ids: Vec<String> = Vec::new();
                for p in &parents {
                    for f in &p.file_ids {
                        if !file_ids.contains(f) {
                            file_ids.push(f.clone());
                        }
                    }
                }
                (
                    SummaryKind::Condensed,
                    depth,
                    earliest,
                    latest,
                    descendant_count,
                    descendant_tokens,
                    source_msg_tokens,
                    file_ids,
                )
            }
        };

    let id = generate_summary_id(&new.content, now_ns);
    let token_count = estimate_tokens(&new.content);

    conn.execute(
        "INSERT INTO summaries (
             id, conversation_id, kind, depth, content, token_count,
             earliest_at, latest_at, descendant_count, descendant_token_count,
             source_message_token_count, file_ids, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            id,
            new.conversation_id,
            kind.as_str(),
            depth,
            new.content,
            token_count,
            ts_to_millis(earliest),
            ts_to_millis(latest),
            descendant_count,
            descendant_tokens,
            source_msg_tokens,
            serde_json::to_string(&file_ids)?,
            now_ms
        ],
    )?;
    let rowid = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO summaries_fts (rowid, content) VALUES (?1, ?2)",
        params![rowid, new.content],
    )?;

    match &new.sources {
        SummarySources::Messages(ids) => {
            let mut stmt = conn.prepare(
                "INSERT INTO summary_messages (summary_id, message_id, ordinal) VALUES (?1, ?2, ?3)",
            )?;
            for (i, mid) in ids.iter().enumerate() {
                stmt.execute(params![id, mid, (i + 1) as i64])?;
            }
        }
        SummarySources::Parents(ids) => {
            let mut stmt = conn.prepare(
                "INSERT INTO summary_parents (summary_id, parent_summary_id, ordinal) VALUES (?1, ?2, ?3)",
            )?;
            for (i, pid) in ids.iter().enumerate() {
                if *pid == id {
                    return Err(LcmError::Invariant(
                        "summary cannot be its own parent".into(),
                    ));
                }
                stmt.execute(params![id, pid, (i + 1) as i64])?;
            }
        }
    }

    tracing::debug!(
        "created {} summary {id} (depth {depth}, {token_count} tokens) in conversation {}",
        kind.as_str(),
        new.conversation_id
    );

    Ok(Summary {
        id,
        conversation_id: new.conversation_id,
        kind,
        depth,
        content: new.content.clone(),
        token_count,
        earliest_at: Some(earliest),
        latest_at: Some(latest),
        descendant_count,
        descendant_token_count: descendant_tokens,
        source_message_token_count: source_msg_tokens,
        file_ids,
        created_at: ts_from_millis(now_ms),
    })
}

/// File references carried by a set of messages' file parts, in message order.
fn file_ids_of_messages(conn: &Connection, message_ids: &[i64]) -> Result<Vec<String>> {
    let parts = messages::parts_for_messages_tx(conn, message_ids)?;
    let mut out = Vec::new();
    for mid in message_ids {
        for stored in parts.get(mid).map(Vec::as_slice).unwrap_or_default() {
            if let MessagePart::File {
                file_id: Some(file_id),
                ..
            } = &stored.part
                && !out.contains(file_id)
            {
                out.push(file_id.clone());
            }
        }
    }
    Ok(out)
}

pub(crate) const SUMMARY_SELECT: &str =
    "SELECT id, conversation_id, kind, depth, content, token_count, earliest_at,
            latest_at, descendant_count, descendant_token_count,
            source_message_token_count, file_ids, created_at
     FROM summaries";

pub(crate) fn get_tx(conn: &Connection, id: &str) -> Result<Option<Summary>> {
    conn.query_row(&format!("{SUMMARY_SELECT} WHERE id = ?1"), [id], map_summary)
        .optional()
        .map_err(LcmError::from)
}

pub(crate) fn parents_tx(conn: &Connection, id: &str) -> Result<Vec<Summary>> {
    let mut stmt = conn.prepare(&format!(
        "{SUMMARY_SELECT} WHERE id IN (
             SELECT parent_summary_id FROM summary_parents WHERE summary_id = ?1
         )"
    ))?;
    let mut by_id = std::collections::HashMap::new();
    for row in stmt.query_map([id], map_summary)? {
        let s = row?;
        by_id.insert(s.id.clone(), s);
    }
    // Re-order by edge ordinal.
    let mut edge_stmt = conn.prepare(
        "SELECT parent_summary_id FROM summary_parents WHERE summary_id = ?1 ORDER BY ordinal",
    )?;
    let ordered_ids: Vec<String> = edge_stmt
        .query_map([id], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    Ok(ordered_ids
        .into_iter()
        .filter_map(|pid| by_id.remove(&pid))
        .collect())
}

pub(crate) fn children_tx(conn: &Connection, id: &str) -> Result<Vec<Summary>> {
    let mut stmt = conn.prepare(&format!(
        "{SUMMARY_SELECT} WHERE id IN (
             SELECT summary_id FROM summary_parents WHERE parent_summary_id = ?1
         ) ORDER BY created_at, rowid"
    ))?;
    let rows = stmt
        .query_map([id], map_summary)?
        .collect::<std::result::Result<_, _>>()?;
    Ok(rows)
}

/// Preorder DFS through parent edges, with an explicit visited set so legacy
/// cycles terminate instead of looping.
pub(crate) fn subtree_tx(
    conn: &Connection,
    root: &str,
    max_depth: Option<usize>,
) -> Result<Vec<SubtreeEntry>> {
    let mut out = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(root.to_string());
    let mut stack: Vec<(String, usize, Vec<String>)> = parents_tx(conn, root)?
        .into_iter()
        .rev()
        .map(|s| (s.id.clone(), 1usize, vec![root.to_string(), s.id]))
        .collect();

    while let Some((id, depth_from_root, path)) = stack.pop() {
        if let Some(cap) = max_depth
            && depth_from_root > cap
        {
            continue;
        }
        if !visited.insert(id.clone()) {
            continue;
        }
        let Some(summary) = get_tx(conn, &id)? else {
            continue;
        };
        let kids = parents_tx(conn, &id)?;
        out.push(SubtreeEntry {
            summary,
            depth_from_root,
            path: path.clone(),
            child_count: kids.len(),
        });
        for kid in kids.into_iter().rev() {
            let mut kid_path = path.clone();
            kid_path.push(kid.id.clone());
            stack.push((kid.id, depth_from_root + 1, kid_path));
        }
    }
    Ok(out)
}

/// Message ids that transitively feed `id`, DFS order, deduplicated.
pub(crate) fn source_messages_tx(
    conn: &Connection,
    id: &str,
    max_depth: usize,
) -> Result<Vec<i64>> {
    fn walk(
        conn: &Connection,
        id: &str,
        remaining: usize,
        visited: &mut HashSet<String>,
        out: &mut Vec<i64>,
    ) -> Result<()> {
        if !visited.insert(id.to_string()) {
            return Ok(());
        }
        let mut stmt = conn.prepare(
            "SELECT message_id FROM summary_messages WHERE summary_id = ?1 ORDER BY ordinal",
        )?;
        let direct: Vec<i64> = stmt
            .query_map([id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        for mid in direct {
            if !out.contains(&mid) {
                out.push(mid);
            }
        }
        if remaining == 0 {
            return Ok(());
        }
        let mut edge_stmt = conn.prepare(
            "SELECT parent_summary_id FROM summary_parents WHERE summary_id = ?1 ORDER BY ordinal",
        )?;
        let parent_ids: Vec<String> = edge_stmt
            .query_map([id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        for pid in parent_ids {
            walk(conn, &pid, remaining - 1, visited, out)?;
        }
        Ok(())
    }

    let mut out = Vec::new();
    let mut visited = HashSet::new();
    walk(conn, id, max_depth, &mut visited, &mut out)?;
    Ok(out)
}

/// Most recent summary at `depth` in a conversation, by creation time with
/// rowid as the tie-break.
pub(crate) fn latest_at_depth_tx(
    conn: &Connection,
    conversation_id: i64,
    depth: i64,
) -> Result<Option<Summary>> {
    conn.query_row(
        &format!(
            "{SUMMARY_SELECT} WHERE conversation_id = ?1 AND depth = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ),
        params![conversation_id, depth],
        map_summary,
    )
    .optional()
    .map_err(LcmError::from)
}

pub(crate) fn map_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<Summary> {
    let kind: String = row.get(2)?;
    let file_ids: String = row.get(11)?;
    Ok(Summary {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        kind: SummaryKind::parse(&kind).unwrap_or(SummaryKind::Leaf),
        depth: row.get(3)?,
        content: row.get(4)?,
        token_count: row.get(5)?,
        earliest_at: row.get::<_, Option<i64>>(6)?.map(ts_from_millis),
        latest_at: row.get::<_, Option<i64>>(7)?.map(ts_from_millis),
        descendant_count: row.get(8)?,
        descendant_token_count: row.get(9)?,
        source_message_token_count: row.get(10)?,
        file_ids: serde_json::from_str(&file_ids).unwrap_or_default(),
        created_at: ts_from_millis(row.get(12)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Role;
    use crate::db::{ConversationRepository, MessageRepository};

    async fn setup() -> (Database, SummaryRepository, MessageRepository, i64) {
        let db = Database::connect_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let (conv, _) = ConversationRepository::new(db.clone())
            .get_or_create("sess-sum")
            .await
            .unwrap();
        (
            db.clone(),
            SummaryRepository::new(db.clone()),
            MessageRepository::new(db),
            conv.id,
        )
    }

    async fn seed_messages(repo: &MessageRepository, conv: i64, n: usize) -> Vec<i64> {
        let mut ids = Vec::new();
        for i in 0..n {
            let msg = repo
                .append(conv, Role::User, format!("message body {i}"), None, None, vec![])
                .await
                .unwrap();
            ids.push(msg.id);
        }
        ids
    }

    #[tokio::test]
    async fn test_leaf_summary_metadata() {
        let (_db, sums, msgs, conv) = setup().await;
        let ids = seed_messages(&msgs, conv, 3).await;
        let leaf = sums
            .create(NewSummary {
                conversation_id: conv,
                content: "what happened".into(),
                sources: SummarySources::Messages(ids.clone()),
            })
            .await
            .unwrap();

        assert_eq!(leaf.kind, SummaryKind::Leaf);
        assert_eq!(leaf.depth, 0);
        assert_eq!(leaf.descendant_count, 0);
        assert!(leaf.source_message_token_count > 0);
        assert!(leaf.earliest_at.unwrap() <= leaf.latest_at.unwrap());
        assert!(leaf.id.starts_with("sum_"));
        assert_eq!(leaf.id.len(), 20);

        assert_eq!(sums.source_messages(&leaf.id, 0).await.unwrap(), ids);
    }

    #[tokio::test]
    async fn test_condensed_summary_metadata() {
        let (_db, sums, msgs, conv) = setup().await;
        let mut leaves = Vec::new();
        for _ in 0..2 {
            let ids = seed_messages(&msgs, conv, 2).await;
            let leaf = sums
                .create(NewSummary {
                    conversation_id: conv,
                    content: "leaf".into(),
                    sources: SummarySources::Messages(ids),
                })
                .await
                .unwrap();
            leaves.push(leaf.id);
        }

        let cond = sums
            .create(NewSummary {
                conversation_id: conv,
                content: "condensed".into(),
                sources: SummarySources::Parents(leaves.clone()),
            })
            .await
            .unwrap();

        assert_eq!(cond.kind, SummaryKind::Condensed);
        assert_eq!(cond.depth, 1);
        assert_eq!(cond.descendant_count, 2);

        let parent_ids: Vec<String> = sums
            .parents(&cond.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(parent_ids, leaves);

        // Subtree DFS covers both leaves one level down.
        let subtree = sums.subtree(&cond.id, None).await.unwrap();
        assert_eq!(subtree.len(), 2);
        assert!(subtree.iter().all(|e| e.depth_from_root == 1));
        assert_eq!(subtree[0].path.len(), 2);

        // Recursive source resolution reaches the messages.
        let sources = sums.source_messages(&cond.id, 5).await.unwrap();
        assert_eq!(sources.len(), 4);
    }

    #[tokio::test]
    async fn test_empty_sources_rejected() {
        let (_db, sums, _msgs, conv) = setup().await;
        let err = sums
            .create(NewSummary {
                conversation_id: conv,
                content: "empty".into(),
                sources: SummarySources::Messages(vec![]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LcmError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_cross_conversation_sources_rejected() {
        let (db, sums, msgs, conv) = setup().await;
        let (other, _) = ConversationRepository::new(db)
            .get_or_create("sess-other")
            .await
            .unwrap();
        let foreign = seed_messages(&msgs, other.id, 1).await;
        let err = sums
            .create(NewSummary {
                conversation_id: conv,
                content: "cross".into(),
                sources: SummarySources::Messages(foreign),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LcmError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_identical_content_gets_distinct_ids() {
        let (_db, sums, msgs, conv) = setup().await;
        let ids = seed_messages(&msgs, conv, 2).await;
        let a = sums
            .create(NewSummary {
                conversation_id: conv,
                content: "same text".into(),
                sources: SummarySources::Messages(vec![ids[0]]),
            })
            .await
            .unwrap();
        let b = sums
            .create(NewSummary {
                conversation_id: conv,
                content: "same text".into(),
                sources: SummarySources::Messages(vec![ids[1]]),
            })
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }
}
