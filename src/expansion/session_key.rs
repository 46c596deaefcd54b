//! Session identity helpers.
//!
//! Delegated sub-agent sessions are addressed by keys of the form
//! `agent:<agent_id>:<session_id>`. These helpers normalize and pick the keys
//! apart; they are deliberately forgiving about whitespace and case and
//! strict about shape.

use crate::error::{LcmError, Result};

/// Canonicalize an agent id: trimmed, lowercased, spaces collapsed to `-`,
/// anything outside `[a-z0-9._-]` dropped.
pub fn normalize_agent_id(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        .collect()
}

/// Split `agent:<agent_id>:<session_id>` into its parts.
pub fn parse_agent_session_key(key: &str) -> Result<(String, String)> {
    let mut parts = key.trim().splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("agent"), Some(agent_id), Some(session_id))
            if !agent_id.is_empty() && !session_id.is_empty() =>
        {
            Ok((normalize_agent_id(agent_id), session_id.to_string()))
        }
        _ => Err(LcmError::Input(format!(
            "malformed agent session key {key:?}; expected agent:<agent_id>:<session_id>"
        ))),
    }
}

/// The bare session id for a session key. Accepts both the `agent:` form and
/// already-bare ids.
pub fn resolve_session_id_from_session_key(key: &str) -> Result<String> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(LcmError::Input("empty session key".into()));
    }
    if trimmed.starts_with("agent:") {
        parse_agent_session_key(trimmed).map(|(_, session_id)| session_id)
    } else {
        Ok(trimmed.to_string())
    }
}
