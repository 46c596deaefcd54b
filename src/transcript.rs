//! Host transcript reconciliation.
//!
//! The host keeps its own JSONL session files; on bootstrap the store catches
//! up from them. Reconciliation never truncates the store: either an anchor
//! message exists in both histories, or bootstrap refuses.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::db::messages::content_hash;
use crate::db::models::Role;
use crate::error::{LcmError, Result};

/// One message parsed out of the host's JSONL session file.
#[derive(Debug, Clone)]
pub struct TranscriptMessage {
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawLine {
    seq: Option<i64>,
    role: Option<String>,
    content: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

/// Parse a JSONL transcript, skipping blank, malformed and non-message lines.
/// Returned messages are sorted by `seq`; duplicate seqs keep the first
/// occurrence.
pub fn read_transcript(path: &Path) -> Result<Vec<TranscriptMessage>> {
    let raw = std::fs::read_to_string(path)?;
    let mut seen = HashMap::new();
    let mut out: Vec<TranscriptMessage> = Vec::new();

    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: RawLine = match serde_json::from_str(line) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("transcript line {} skipped: {e}", lineno + 1);
                continue;
            }
        };
        let (Some(seq), Some(role), Some(content)) = (parsed.seq, parsed.role, parsed.content)
        else {
            continue;
        };
        let Ok(role) = Role::parse(&role) else {
            tracing::debug!("transcript line {} has unknown role {role:?}", lineno + 1);
            continue;
        };
        if seen.insert(seq, ()).is_some() {
            tracing::warn!("transcript has duplicate seq {seq}; keeping the first");
            continue;
        }
        out.push(TranscriptMessage {
            seq,
            role,
            content,
            created_at: parsed.timestamp,
        });
    }

    out.sort_by_key(|m| m.seq);
    Ok(out)
}

/// The import work a bootstrap has to do.
#[derive(Debug)]
pub struct ReconciliationPlan {
    /// Newest message present in both histories; `None` when the store was
    /// empty.
    pub anchor_seq: Option<i64>,
    /// Transcript messages to import, in ascending `seq` order.
    pub to_import: Vec<TranscriptMessage>,
}

/// Match the transcript against the stored message identities and decide what
/// to import.
///
/// The anchor is the newest `(seq, role, content-hash)` triple present in
/// both. With a non-empty store and no anchor, the two histories cannot be
/// merged without data loss and the plan fails.
pub fn plan_reconciliation(
    transcript: &[TranscriptMessage],
    stored: &HashMap<i64, (Role, [u8; 32])>,
) -> Result<ReconciliationPlan> {
    if stored.is_empty() {
        return Ok(ReconciliationPlan {
            anchor_seq: None,
            to_import: transcript.to_vec(),
        });
    }

    let anchor_seq = transcript
        .iter()
        .rev()
        .find(|m| {
            stored
                .get(&m.seq)
                .is_some_and(|(role, hash)| *role == m.role && *hash == content_hash(&m.content))
        })
        .map(|m| m.seq);

    let Some(anchor_seq) = anchor_seq else {
        return Err(LcmError::Reconciliation(
            "store holds messages but none match the transcript; refusing to truncate".into(),
        ));
    };

    let store_max = stored.keys().copied().max().unwrap_or(0);
    let mut to_import = Vec::new();
    for msg in transcript.iter().filter(|m| m.seq > anchor_seq) {
        if stored.contains_key(&msg.seq) {
            continue;
        }
        if msg.seq <= store_max {
            // Inserting here would violate seq monotonicity; the store side
            // wins and the transcript row is dropped.
            tracing::warn!(
                "transcript message seq {} falls inside stored history; skipping",
                msg.seq
            );
            continue;
        }
        to_import.push(msg.clone());
    }

    Ok(ReconciliationPlan {
        anchor_seq: Some(anchor_seq),
        to_import,
    })
}
