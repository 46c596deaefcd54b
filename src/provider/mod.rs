//! Host collaborator contracts.
//!
//! The engine never talks to a model or an agent gateway directly; the host
//! supplies these trait objects. Both are consumed behind `Arc<dyn …>` so
//! tests can script them.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{LcmError, Result};

/// Options threaded into every summarization call.
#[derive(Debug, Clone, Default)]
pub struct SummarizeOptions {
    /// Content of the most recent summary at the target depth, for
    /// incremental continuity. Empty when none exists.
    pub previous_summary: String,
    /// True when the input is summary content being condensed further.
    pub is_condensed: bool,
    /// Target depth of the summary being produced (condensation only).
    pub depth: Option<i64>,
    /// Output size hint in tokens.
    pub target_tokens: i64,
}

/// External summarization collaborator.
///
/// May return an empty string; must not mutate engine state. Failures abort
/// the requesting pass and are handled by the caller.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, aggressive: bool, opts: &SummarizeOptions)
    -> Result<String>;
}

/// Methods the sub-agent gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMethod {
    Agent,
    AgentWait,
    SessionsGet,
    SessionsDelete,
}

impl GatewayMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayMethod::Agent => "agent",
            GatewayMethod::AgentWait => "agent.wait",
            GatewayMethod::SessionsGet => "sessions.get",
            GatewayMethod::SessionsDelete => "sessions.delete",
        }
    }
}

impl std::fmt::Display for GatewayMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host gateway used by delegated expansion orchestration. The engine does
/// not interpret agent transcripts beyond [`read_latest_assistant_reply`].
#[async_trait]
pub trait SubAgentGateway: Send + Sync {
    async fn call(&self, method: GatewayMethod, params: Value, timeout_ms: u64) -> Result<Value>;
}

/// Pull the latest assistant reply text out of a `sessions.get` response.
///
/// The transcript shape is `{messages: [{role, content: [{type, text?}, …]}]}`;
/// content may also be a bare string.
pub fn read_latest_assistant_reply(session: &Value) -> Result<String> {
    let messages = session
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| LcmError::External("session payload has no messages array".into()))?;

    let reply = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("assistant"))
        .ok_or_else(|| LcmError::External("session has no assistant reply".into()))?;

    match reply.get("content") {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(blocks)) => {
            let mut out = String::new();
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text")
                    && let Some(text) = block.get("text").and_then(Value::as_str)
                {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                }
            }
            Ok(out)
        }
        _ => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_latest_assistant_reply_blocks() {
        let session = json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "first"},
                    {"type": "tool_call", "id": "x"},
                    {"type": "text", "text": "second"}
                ]},
            ]
        });
        assert_eq!(
            read_latest_assistant_reply(&session).unwrap(),
            "first\nsecond"
        );
    }

    #[test]
    fn test_read_latest_assistant_reply_picks_newest() {
        let session = json!({
            "messages": [
                {"role": "assistant", "content": "old"},
                {"role": "user", "content": "again"},
                {"role": "assistant", "content": "new"},
            ]
        });
        assert_eq!(read_latest_assistant_reply(&session).unwrap(), "new");
    }

    #[test]
    fn test_read_latest_assistant_reply_missing() {
        let session = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert!(read_latest_assistant_reply(&session).is_err());
        assert!(read_latest_assistant_reply(&json!({})).is_err());
    }
}
