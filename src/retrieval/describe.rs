//! Single-node description with subtree manifest.
//!
//! `describe` answers "what is this id and what would it cost to expand":
//! the node itself, its immediate relatives, and a DFS manifest of the whole
//! subtree with per-node expansion costs evaluated against the caller's
//! token cap.

use chrono::{DateTime, Utc};

use crate::db::models::{LargeFile, Summary, SummaryKind};
use crate::db::{Database, large_files, summaries};
use crate::error::{LcmError, Result};

/// Cost of expanding one node's subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandCosts {
    /// Node content plus all descendant summary content.
    pub summaries_only: i64,
    /// The above plus the underlying source messages.
    pub with_messages: i64,
}

/// Whether each cost fits the caller's effective token cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetFit {
    pub summaries_only: bool,
    pub with_messages: bool,
}

/// One row of the subtree manifest.
#[derive(Debug, Clone)]
pub struct SubtreeNode {
    pub summary_id: String,
    /// The node one step closer to the described root; `None` on the root.
    pub parent_summary_id: Option<String>,
    pub depth_from_root: usize,
    pub depth: i64,
    pub kind: SummaryKind,
    pub token_count: i64,
    pub descendant_count: i64,
    pub descendant_token_count: i64,
    pub source_message_token_count: i64,
    pub child_count: usize,
    /// Ids from the root down to this node.
    pub path: Vec<String>,
    pub earliest_at: Option<DateTime<Utc>>,
    pub latest_at: Option<DateTime<Utc>>,
    pub costs: ExpandCosts,
    pub budget_fit: BudgetFit,
}

#[derive(Debug, Clone)]
pub struct SummaryDescription {
    pub summary: Summary,
    pub parent_ids: Vec<String>,
    pub child_ids: Vec<String>,
    /// Direct source messages; populated for leaves only.
    pub source_message_ids: Vec<i64>,
    pub subtree: Vec<SubtreeNode>,
}

#[derive(Debug, Clone)]
pub enum DescribeResult {
    Summary(Box<SummaryDescription>),
    File(LargeFile),
}

pub(super) async fn run(db: &Database, id: &str, token_cap: i64) -> Result<DescribeResult> {
    let id = id.to_string();
    db.interact(move |conn| {
        if id.starts_with("sum_") {
            let summary = summaries::get_tx(conn, &id)?
                .ok_or_else(|| LcmError::NotFound(format!("summary {id}")))?;

            let parent_ids: Vec<String> = summaries::parents_tx(conn, &id)?
                .into_iter()
                .map(|s| s.id)
                .collect();
            let child_ids: Vec<String> = summaries::children_tx(conn, &id)?
                .into_iter()
                .map(|s| s.id)
                .collect();
            let source_message_ids = if summary.kind == SummaryKind::Leaf {
                summaries::source_messages_tx(conn, &id, 0)?
            } else {
                Vec::new()
            };

            let mut subtree = Vec::new();
            subtree.push(manifest_node(&summary, None, 0, vec![id.clone()], parent_ids.len(), token_cap));
            for entry in summaries::subtree_tx(conn, &id, None)? {
                let parent = entry.path.iter().rev().nth(1).cloned();
                subtree.push(manifest_node(
                    &entry.summary,
                    parent,
                    entry.depth_from_root,
                    entry.path,
                    entry.child_count,
                    token_cap,
                ));
            }

            Ok(DescribeResult::Summary(Box::new(SummaryDescription {
                summary,
                parent_ids,
                child_ids,
                source_message_ids,
                subtree,
            })))
        } else if id.starts_with("file_") {
            let file = large_files::get_tx(conn, &id)?
                .ok_or_else(|| LcmError::NotFound(format!("large file {id}")))?;
            Ok(DescribeResult::File(file))
        } else {
            Err(LcmError::Input(format!(
                "describe expects a sum_ or file_ id, got {id:?}"
            )))
        }
    })
    .await
}

fn manifest_node(
    summary: &Summary,
    parent_summary_id: Option<String>,
    depth_from_root: usize,
    path: Vec<String>,
    child_count: usize,
    token_cap: i64,
) -> SubtreeNode {
    let summaries_only = summary.token_count + summary.descendant_token_count;
    let with_messages = summaries_only + summary.source_message_token_count;
    SubtreeNode {
        summary_id: summary.id.clone(),
        parent_summary_id,
        depth_from_root,
        depth: summary.depth,
        kind: summary.kind,
        token_count: summary.token_count,
        descendant_count: summary.descendant_count,
        descendant_token_count: summary.descendant_token_count,
        source_message_token_count: summary.source_message_token_count,
        child_count,
        path,
        earliest_at: summary.earliest_at,
        latest_at: summary.latest_at,
        costs: ExpandCosts {
            summaries_only,
            with_messages,
        },
        budget_fit: BudgetFit {
            summaries_only: summaries_only <= token_cap,
            with_messages: with_messages <= token_cap,
        },
    }
}
