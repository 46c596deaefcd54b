//! Bounded DAG expansion.
//!
//! Walks the subtree under a summary DFS-style, accumulating summary content
//! (and optionally the underlying messages) until the token cap would be
//! exceeded. Partial results come back with `truncated = true` so callers can
//! re-issue with a narrower scope instead of failing.

use chrono::{DateTime, Utc};

use crate::db::models::{Role, SummaryKind};
use crate::db::{Database, messages, summaries};
use crate::error::{LcmError, Result};

#[derive(Debug, Clone)]
pub struct ExpandOptions {
    /// Bound on traversal depth below the root; `None` walks to the leaves.
    pub max_depth: Option<usize>,
    /// Hard cap on accumulated estimated tokens.
    pub token_cap: i64,
    /// Also pull source messages under each visited leaf.
    pub include_messages: bool,
}

#[derive(Debug, Clone)]
pub struct ExpandedNode {
    pub summary_id: String,
    pub kind: SummaryKind,
    pub depth: i64,
    pub depth_from_root: usize,
    pub content: String,
    pub token_count: i64,
}

#[derive(Debug, Clone)]
pub struct ExpandedMessage {
    pub message_id: i64,
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub token_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExpandResult {
    pub summary_id: String,
    pub children: Vec<ExpandedNode>,
    pub messages: Vec<ExpandedMessage>,
    pub estimated_tokens: i64,
    pub truncated: bool,
}

pub(super) async fn run(
    db: &Database,
    summary_id: &str,
    options: ExpandOptions,
) -> Result<ExpandResult> {
    if options.token_cap <= 0 {
        return Err(LcmError::Input(format!(
            "expand token cap must be positive, got {}",
            options.token_cap
        )));
    }
    let root_id = summary_id.to_string();

    db.interact(move |conn| {
        let root = summaries::get_tx(conn, &root_id)?
            .ok_or_else(|| LcmError::NotFound(format!("summary {root_id}")))?;

        let mut result = ExpandResult {
            summary_id: root.id.clone(),
            children: Vec::new(),
            messages: Vec::new(),
            estimated_tokens: 0,
            truncated: false,
        };

        // The root's own content is already in the caller's hands; only its
        // messages are expandable when the root is itself a leaf.
        if options.include_messages
            && root.kind == SummaryKind::Leaf
            && !push_leaf_messages(conn, &root.id, &options, &mut result)?
        {
            return Ok(result);
        }

        for entry in summaries::subtree_tx(conn, &root_id, options.max_depth)? {
            let node = &entry.summary;
            if result.estimated_tokens + node.token_count > options.token_cap {
                result.truncated = true;
                break;
            }
            result.estimated_tokens += node.token_count;
            result.children.push(ExpandedNode {
                summary_id: node.id.clone(),
                kind: node.kind,
                depth: node.depth,
                depth_from_root: entry.depth_from_root,
                content: node.content.clone(),
                token_count: node.token_count,
            });

            if options.include_messages
                && node.kind == SummaryKind::Leaf
                && !push_leaf_messages(conn, &node.id, &options, &mut result)?
            {
                return Ok(result);
            }
        }

        Ok(result)
    })
    .await
}

/// Append a leaf's source messages until the cap would be exceeded.
/// Returns false (with `truncated` set) when the walk should stop.
fn push_leaf_messages(
    conn: &rusqlite::Connection,
    leaf_id: &str,
    options: &ExpandOptions,
    result: &mut ExpandResult,
) -> Result<bool> {
    let source_ids = summaries::source_messages_tx(conn, leaf_id, 0)?;
    let msgs = messages::fetch_by_ids_tx(conn, &source_ids)?;
    for msg in msgs {
        if result.estimated_tokens + msg.token_count > options.token_cap {
            result.truncated = true;
            return Ok(false);
        }
        result.estimated_tokens += msg.token_count;
        result.messages.push(ExpandedMessage {
            message_id: msg.id,
            seq: msg.seq,
            role: msg.role,
            content: msg.content,
            token_count: msg.token_count,
            created_at: msg.created_at,
        });
    }
    Ok(true)
}
