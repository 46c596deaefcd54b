//! Row types for the embedded store.
//!
//! Host callbacks deliver unshaped JSON; everything is narrowed into these
//! types at the ingest boundary. Core logic never touches raw maps.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LcmError, Result};

/// Message role. The store rejects anything outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(LcmError::Input(format!("unknown role {other:?}"))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation, keyed externally by `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub session_id: String,
    pub title: Option<String>,
    pub bootstrapped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted message. Immutable after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub token_count: i64,
    pub stop_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Structured sub-block of a message, preserved so the assembler can rebuild
/// rich content instead of flat text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Patch {
        #[serde(default)]
        title: Option<String>,
        diff: String,
    },
    File {
        file_name: String,
        #[serde(default)]
        mime_type: Option<String>,
        /// Inline payload (UTF-8 text or base64). Cleared once the sidecar
        /// extracts the file.
        #[serde(default)]
        content: Option<String>,
        /// Set when the payload lives in the large-file sidecar.
        #[serde(default)]
        file_id: Option<String>,
    },
    Subtask {
        #[serde(default)]
        data: Value,
    },
    Step {
        #[serde(default)]
        data: Value,
    },
    Snapshot {
        #[serde(default)]
        data: Value,
    },
    Agent {
        #[serde(default)]
        data: Value,
    },
    Retry {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Forward-compat envelope for kinds this build does not know.
    Other {
        kind: String,
        #[serde(default)]
        data: Value,
    },
}

impl MessagePart {
    /// Narrow an unshaped host block into a typed part. Unknown `type` tags
    /// are preserved in the `Other` envelope instead of being dropped.
    pub fn from_value(v: Value) -> Result<Self> {
        let kind = v
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| LcmError::Input("message part missing \"type\"".into()))?
            .to_string();

        match serde_json::from_value::<MessagePart>(v.clone()) {
            Ok(part) => Ok(part),
            Err(_) => Ok(MessagePart::Other { kind, data: v }),
        }
    }

    /// The `kind` column value for this part.
    pub fn kind(&self) -> &str {
        match self {
            MessagePart::Text { .. } => "text",
            MessagePart::Reasoning { .. } => "reasoning",
            MessagePart::ToolCall { .. } => "tool_call",
            MessagePart::ToolResult { .. } => "tool_result",
            MessagePart::Patch { .. } => "patch",
            MessagePart::File { .. } => "file",
            MessagePart::Subtask { .. } => "subtask",
            MessagePart::Step { .. } => "step",
            MessagePart::Snapshot { .. } => "snapshot",
            MessagePart::Agent { .. } => "agent",
            MessagePart::Retry { .. } => "retry",
            MessagePart::Other { kind, .. } => kind,
        }
    }
}

/// A message part as stored, with its position within the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPart {
    pub message_id: i64,
    pub ordinal: i64,
    pub part: MessagePart,
}

/// Summary node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryKind {
    Leaf,
    Condensed,
}

impl SummaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryKind::Leaf => "leaf",
            SummaryKind::Condensed => "condensed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "leaf" => Ok(SummaryKind::Leaf),
            "condensed" => Ok(SummaryKind::Condensed),
            other => Err(LcmError::Invariant(format!("unknown summary kind {other:?}"))),
        }
    }
}

/// A summary DAG node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub conversation_id: i64,
    pub kind: SummaryKind,
    pub depth: i64,
    pub content: String,
    pub token_count: i64,
    pub earliest_at: Option<DateTime<Utc>>,
    pub latest_at: Option<DateTime<Utc>>,
    pub descendant_count: i64,
    pub descendant_token_count: i64,
    pub source_message_token_count: i64,
    pub file_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    /// Time range start with the `created_at` fallback the DAG invariants use.
    pub fn earliest_or_created(&self) -> DateTime<Utc> {
        self.earliest_at.unwrap_or(self.created_at)
    }

    /// Time range end with the `created_at` fallback.
    pub fn latest_or_created(&self) -> DateTime<Utc> {
        self.latest_at.unwrap_or(self.created_at)
    }
}

/// Context item kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextItemKind {
    Message,
    Summary,
}

impl ContextItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextItemKind::Message => "message",
            ContextItemKind::Summary => "summary",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "message" => Ok(ContextItemKind::Message),
            "summary" => Ok(ContextItemKind::Summary),
            other => Err(LcmError::Invariant(format!(
                "unknown context item kind {other:?}"
            ))),
        }
    }
}

/// One entry in the ordered model-visible context stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub conversation_id: i64,
    pub ordinal: i64,
    pub kind: ContextItemKind,
    pub message_id: Option<i64>,
    pub summary_id: Option<String>,
}

/// A context item joined with the token count, creation time and (for
/// summaries) depth of its referenced row. This is the view the compaction
/// engine and assembler scan.
#[derive(Debug, Clone)]
pub struct SequencedItem {
    pub ordinal: i64,
    pub kind: ContextItemKind,
    pub message_id: Option<i64>,
    pub summary_id: Option<String>,
    pub token_count: i64,
    pub created_at: DateTime<Utc>,
    /// Depth of the referenced summary; `None` for message items.
    pub depth: Option<i64>,
}

impl SequencedItem {
    pub fn is_message(&self) -> bool {
        self.kind == ContextItemKind::Message
    }
}

/// Metadata for an extracted large file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LargeFile {
    pub id: String,
    pub conversation_id: i64,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub byte_size: i64,
    pub storage_uri: String,
    pub exploration_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Convert a stored epoch-millisecond column into a UTC timestamp.
pub(crate) fn ts_from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().expect("epoch"))
}

/// Convert a UTC timestamp into the epoch-millisecond column value.
pub(crate) fn ts_to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(Role::parse(role.as_str()).unwrap(), role);
        }
        assert!(Role::parse("moderator").is_err());
    }

    #[test]
    fn test_part_narrowing_typed() {
        let part = MessagePart::from_value(json!({
            "type": "tool_call",
            "id": "call_1",
            "name": "grep",
            "input": {"pattern": "foo"}
        }))
        .unwrap();
        assert_eq!(part.kind(), "tool_call");
        match part {
            MessagePart::ToolCall { id, name, .. } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "grep");
            }
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[test]
    fn test_part_narrowing_unknown_kind() {
        let part = MessagePart::from_value(json!({"type": "hologram", "x": 1})).unwrap();
        match &part {
            MessagePart::Other { kind, data } => {
                assert_eq!(kind, "hologram");
                assert_eq!(data["x"], 1);
            }
            other => panic!("unexpected part: {other:?}"),
        }
        assert_eq!(part.kind(), "hologram");
    }

    #[test]
    fn test_part_missing_type_rejected() {
        assert!(MessagePart::from_value(json!({"text": "hi"})).is_err());
    }

    #[test]
    fn test_part_serde_round_trip() {
        let part = MessagePart::ToolResult {
            tool_call_id: "call_9".into(),
            content: json!([{"type": "text", "text": "ok"}]),
            is_error: false,
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "tool_result");
        assert_eq!(MessagePart::from_value(v).unwrap(), part);
    }

    #[test]
    fn test_ts_millis_round_trip() {
        let now = Utc::now();
        let back = ts_from_millis(ts_to_millis(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
