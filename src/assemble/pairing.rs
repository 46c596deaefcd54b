//! Tool-pairing repair.
//!
//! Downstream model APIs reject histories where a tool call is not
//! immediately answered by a matching result. Budget eviction can break that
//! pairing arbitrarily, so the final assembled sequence is repaired:
//!
//! - every assistant tool call is followed by its matching result turn;
//! - missing results are synthesized as error results carrying the call id;
//! - duplicate results for one id are dropped (first wins);
//! - orphan results with no surviving call are dropped;
//! - assistant turns that stopped with `error`/`aborted` are left opaque.
//!
//! The repair is idempotent: its output passes through unchanged.

use serde_json::json;
use std::collections::HashMap;

use super::content::{AssembledTurn, ContentBlock};
use crate::db::models::Role;

/// Stop reasons whose tool calls are not trusted for extraction.
const OPAQUE_STOP_REASONS: &[&str] = &["error", "aborted"];

pub fn repair_tool_pairing(turns: Vec<AssembledTurn>) -> Vec<AssembledTurn> {
    // First pass: index every tool result by id, first occurrence wins.
    // Result turns are exploded so one turn answers one call.
    let mut results: HashMap<String, AssembledTurn> = HashMap::new();
    for turn in turns.iter().filter(|t| t.is_tool_result_turn()) {
        for block in &turn.blocks {
            let ContentBlock::ToolResult { tool_call_id, .. } = block else {
                continue;
            };
            results
                .entry(tool_call_id.clone())
                .or_insert_with(|| AssembledTurn {
                    role: Role::Tool,
                    blocks: vec![block.clone()],
                    stop_reason: None,
                });
        }
    }

    let mut out = Vec::with_capacity(turns.len());
    for turn in turns {
        if turn.is_tool_result_turn() {
            // Re-emitted behind their calls below; orphans vanish here.
            continue;
        }
        let extract = turn.role == Role::Assistant
            && !turn
                .stop_reason
                .as_deref()
                .is_some_and(|r| OPAQUE_STOP_REASONS.contains(&r));
        let call_ids: Vec<String> = if extract {
            turn.blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolCall { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };

        out.push(turn);
        for id in call_ids {
            match results.remove(&id) {
                Some(result_turn) => out.push(result_turn),
                None => {
                    tracing::debug!("synthesizing missing tool result for call {id}");
                    out.push(synthetic_error_result(&id));
                }
            }
        }
    }
    out
}

/// Stand-in for a tool result that was evicted or never recorded.
fn synthetic_error_result(tool_call_id: &str) -> AssembledTurn {
    AssembledTurn {
        role: Role::Tool,
        blocks: vec![ContentBlock::ToolResult {
            tool_call_id: tool_call_id.to_string(),
            content: json!([{
                "type": "text",
                "text": "Tool result unavailable: it was compacted out of the \
                         context or never recorded."
            }]),
            is_error: true,
        }],
        stop_reason: None,
    }
}
