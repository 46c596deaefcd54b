//! Turn materialization.
//!
//! Context items become model-visible turns here: messages are rebuilt from
//! their structured parts (never flattened back to plain text when parts
//! exist), and summaries become synthetic user turns carrying an XML envelope
//! the model can cite by id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::models::{MessagePart, Role, Summary, SummaryKind};
use crate::tokenizer::estimate_tokens;

/// A content block inside an assembled turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        content: Value,
        is_error: bool,
    },
    FileRef {
        file_id: String,
        file_name: String,
        mime_type: Option<String>,
    },
    /// Structured part with no model-facing rendering of its own.
    Opaque {
        kind: String,
        data: Value,
    },
}

/// One model-visible turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledTurn {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

impl AssembledTurn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            blocks: vec![ContentBlock::Text { text: text.into() }],
            stop_reason: None,
        }
    }

    /// Estimated tokens of everything the model will see for this turn.
    pub fn token_count(&self) -> i64 {
        self.blocks.iter().map(block_tokens).sum()
    }

    /// True when this turn only carries tool results.
    pub fn is_tool_result_turn(&self) -> bool {
        !self.blocks.is_empty()
            && self
                .blocks
                .iter()
                .all(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }
}

fn block_tokens(block: &ContentBlock) -> i64 {
    match block {
        ContentBlock::Text { text } | ContentBlock::Reasoning { text } => estimate_tokens(text),
        ContentBlock::ToolCall { id, name, input } => {
            estimate_tokens(id) + estimate_tokens(name) + estimate_tokens(&input.to_string())
        }
        ContentBlock::ToolResult {
            tool_call_id,
            content,
            ..
        } => estimate_tokens(tool_call_id) + estimate_tokens(&content.to_string()),
        ContentBlock::FileRef {
            file_id, file_name, ..
        } => estimate_tokens(file_id) + estimate_tokens(file_name),
        ContentBlock::Opaque { data, .. } => estimate_tokens(&data.to_string()),
    }
}

/// Rebuild a message's blocks from its stored parts. Messages without parts
/// fall back to one text block over the flat content; assistant turns are
/// always block arrays either way.
pub fn blocks_from_parts(content: &str, parts: &[MessagePart]) -> Vec<ContentBlock> {
    if parts.is_empty() {
        return vec![ContentBlock::Text {
            text: content.to_string(),
        }];
    }
    parts.iter().map(block_from_part).collect()
}

fn block_from_part(part: &MessagePart) -> ContentBlock {
    match part {
        MessagePart::Text { text } => ContentBlock::Text { text: text.clone() },
        MessagePart::Reasoning { text } => ContentBlock::Reasoning { text: text.clone() },
        MessagePart::ToolCall { id, name, input } => ContentBlock::ToolCall {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        MessagePart::ToolResult {
            tool_call_id,
            content,
            is_error,
        } => ContentBlock::ToolResult {
            tool_call_id: tool_call_id.clone(),
            content: content.clone(),
            is_error: *is_error,
        },
        MessagePart::Patch { title, diff } => ContentBlock::Text {
            text: match title {
                Some(t) => format!("{t}\n{diff}"),
                None => diff.clone(),
            },
        },
        MessagePart::File {
            file_name,
            mime_type,
            content,
            file_id,
        } => match (file_id, content) {
            (Some(id), _) => ContentBlock::FileRef {
                file_id: id.clone(),
                file_name: file_name.clone(),
                mime_type: mime_type.clone(),
            },
            (None, Some(inline)) => ContentBlock::Text {
                text: format!("[file {file_name}]\n{inline}"),
            },
            (None, None) => ContentBlock::Text {
                text: format!("[file {file_name}]"),
            },
        },
        MessagePart::Subtask { data } => ContentBlock::Opaque {
            kind: "subtask".into(),
            data: data.clone(),
        },
        MessagePart::Step { data } => ContentBlock::Opaque {
            kind: "step".into(),
            data: data.clone(),
        },
        MessagePart::Snapshot { data } => ContentBlock::Opaque {
            kind: "snapshot".into(),
            data: data.clone(),
        },
        MessagePart::Agent { data } => ContentBlock::Opaque {
            kind: "agent".into(),
            data: data.clone(),
        },
        MessagePart::Retry { reason } => ContentBlock::Opaque {
            kind: "retry".into(),
            data: Value::String(reason.clone().unwrap_or_default()),
        },
        MessagePart::Other { kind, data } => ContentBlock::Opaque {
            kind: kind.clone(),
            data: data.clone(),
        },
    }
}

/// Render a summary as a synthetic user turn with the XML envelope.
pub fn summary_turn(summary: &Summary, parent_ids: &[String]) -> AssembledTurn {
    let earliest = summary
        .earliest_or_created()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let latest = summary
        .latest_or_created()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let mut xml = format!(
        "<summary id=\"{}\" kind=\"{}\" depth=\"{}\" descendant_count=\"{}\" \
         earliest_at=\"{}\" latest_at=\"{}\">\n",
        summary.id,
        summary.kind.as_str(),
        summary.depth,
        summary.descendant_count,
        earliest,
        latest,
    );
    if summary.kind == SummaryKind::Condensed && !parent_ids.is_empty() {
        xml.push_str(&format!("  <parents>{}</parents>\n", parent_ids.join(" ")));
    }
    xml.push_str(&format!(
        "  <content>{}</content>\n</summary>",
        escape_xml(&summary.content)
    ));

    AssembledTurn::text(Role::User, xml)
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
