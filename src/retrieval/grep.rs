//! Grep over messages and summaries.
//!
//! Regex mode evaluates in-process against stored content; full-text mode
//! rides the contentless FTS5 indexes with bm25 ranking. Both return the same
//! snippet-shaped hits.

use regex::Regex;
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;

use super::RetrievalScope;
use crate::db::Database;
use crate::db::models::{ts_from_millis, ts_to_millis};
use crate::error::{LcmError, Result};
use crate::tokenizer::floor_char_boundary;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 200;
const SNIPPET_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrepMode {
    Regex,
    FullText,
}

/// Which record kinds to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrepTarget {
    Messages,
    Summaries,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HitKind {
    Message,
    Summary,
}

#[derive(Debug, Clone)]
pub struct GrepRequest {
    pub pattern: String,
    pub mode: GrepMode,
    pub target: GrepTarget,
    pub scope: RetrievalScope,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct GrepHit {
    /// Message row id rendered decimal, or the `sum_…` summary id.
    pub id: String,
    pub kind: HitKind,
    pub snippet: String,
    pub conversation_id: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// bm25 rank for full-text hits; absent in regex mode.
    pub rank: Option<f64>,
}

pub(super) async fn run(db: &Database, request: GrepRequest) -> Result<Vec<GrepHit>> {
    if request.pattern.trim().is_empty() {
        return Err(LcmError::Input("grep pattern must not be empty".into()));
    }
    let limit = request.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    db.interact(move |conn| {
        let mut hits = match request.mode {
            GrepMode::Regex => regex_grep(conn, &request, limit)?,
            GrepMode::FullText => fts_grep(conn, &request, limit)?,
        };
        hits.truncate(limit);
        Ok(hits)
    })
    .await
}

/// Scope filter clauses over an aliased row set with `conversation_id` and
/// `created_at` columns.
fn scope_sql(scope: &RetrievalScope, alias: &str, params: &mut Vec<SqlValue>) -> String {
    let mut sql = String::new();
    if let Some(ids) = &scope.conversation_ids {
        let placeholders = vec!["?"; ids.len().max(1)].join(", ");
        sql.push_str(&format!(" AND {alias}.conversation_id IN ({placeholders})"));
        if ids.is_empty() {
            params.push(SqlValue::Integer(-1));
        }
        for id in ids {
            params.push(SqlValue::Integer(*id));
        }
    }
    if let Some(since) = scope.since {
        sql.push_str(&format!(" AND {alias}.created_at >= ?"));
        params.push(SqlValue::Integer(ts_to_millis(since)));
    }
    if let Some(before) = scope.before {
        sql.push_str(&format!(" AND {alias}.created_at < ?"));
        params.push(SqlValue::Integer(ts_to_millis(before)));
    }
    sql
}

fn regex_grep(conn: &Connection, request: &GrepRequest, limit: usize) -> Result<Vec<GrepHit>> {
    let re = Regex::new(&request.pattern)
        .map_err(|e| LcmError::Input(format!("invalid regex: {e}")))?;
    let mut hits = Vec::new();

    if matches!(request.target, GrepTarget::Messages | GrepTarget::Both) {
        let mut params: Vec<SqlValue> = Vec::new();
        let sql = format!(
            "SELECT m.id, m.conversation_id, m.content, m.created_at
             FROM messages m WHERE 1=1{}
             ORDER BY m.created_at DESC, m.id DESC",
            scope_sql(&request.scope, "m", &mut params)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (id, conversation_id, content, created_at) = row?;
            if let Some(m) = re.find(&content) {
                hits.push(GrepHit {
                    id: id.to_string(),
                    kind: HitKind::Message,
                    snippet: snippet_around(&content, m.start(), SNIPPET_LEN),
                    conversation_id,
                    created_at: ts_from_millis(created_at),
                    rank: None,
                });
                if hits.len() >= limit {
                    return Ok(hits);
                }
            }
        }
    }

    if matches!(request.target, GrepTarget::Summaries | GrepTarget::Both) {
        let mut params: Vec<SqlValue> = Vec::new();
        let sql = format!(
            "SELECT s.id, s.conversation_id, s.content, s.created_at
             FROM summaries s WHERE 1=1{}
             ORDER BY s.created_at DESC, s.rowid DESC",
            scope_sql(&request.scope, "s", &mut params)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (id, conversation_id, content, created_at) = row?;
            if let Some(m) = re.find(&content) {
                hits.push(GrepHit {
                    id,
                    kind: HitKind::Summary,
                    snippet: snippet_around(&content, m.start(), SNIPPET_LEN),
                    conversation_id,
                    created_at: ts_from_millis(created_at),
                    rank: None,
                });
                if hits.len() >= limit {
                    return Ok(hits);
                }
            }
        }
    }

    Ok(hits)
}

fn fts_grep(conn: &Connection, request: &GrepRequest, limit: usize) -> Result<Vec<GrepHit>> {
    let query = sanitize_fts_query(&request.pattern);
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let mut hits = Vec::new();

    if matches!(request.target, GrepTarget::Messages | GrepTarget::Both) {
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(query.clone())];
        let sql = format!(
            "SELECT m.id, m.conversation_id, m.content, m.created_at, bm25(messages_fts)
             FROM messages_fts
             JOIN messages m ON m.id = messages_fts.rowid
             WHERE messages_fts MATCH ?{}
             ORDER BY bm25(messages_fts) LIMIT {limit}",
            scope_sql(&request.scope, "m", &mut params)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;
        for row in rows {
            let (id, conversation_id, content, created_at, rank) = row?;
            hits.push(GrepHit {
                id: id.to_string(),
                kind: HitKind::Message,
                snippet: snippet_for_terms(&content, &query, SNIPPET_LEN),
                conversation_id,
                created_at: ts_from_millis(created_at),
                rank: Some(rank),
            });
        }
    }

    if matches!(request.target, GrepTarget::Summaries | GrepTarget::Both) {
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(query.clone())];
        let sql = format!(
            "SELECT s.id, s.conversation_id, s.content, s.created_at, bm25(summaries_fts)
             FROM summaries_fts
             JOIN summaries s ON s.rowid = summaries_fts.rowid
             WHERE summaries_fts MATCH ?{}
             ORDER BY bm25(summaries_fts) LIMIT {limit}",
            scope_sql(&request.scope, "s", &mut params)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;
        for row in rows {
            let (id, conversation_id, content, created_at, rank) = row?;
            hits.push(GrepHit {
                id,
                kind: HitKind::Summary,
                snippet: snippet_for_terms(&content, &query, SNIPPET_LEN),
                conversation_id,
                created_at: ts_from_millis(created_at),
                rank: Some(rank),
            });
        }
    }

    // Lower bm25 is better; merge the two streams by rank.
    hits.sort_by(|a, b| {
        a.rank
            .unwrap_or(0.0)
            .partial_cmp(&b.rank.unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(hits)
}

/// Sanitize a query for FTS5: strip embedded quotes, quote each word, join
/// with implicit AND.
fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            let clean: String = w.chars().filter(|c| *c != '"').collect();
            format!("\"{clean}\"")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Window around the first term match, for FTS hits.
fn snippet_for_terms(body: &str, query: &str, max_len: usize) -> String {
    let body_lower = body.to_lowercase();
    let mut best_pos = 0;
    for word in query.to_lowercase().split_whitespace() {
        let clean: String = word.chars().filter(|c| *c != '"').collect();
        if !clean.is_empty()
            && let Some(pos) = body_lower.find(&clean)
        {
            best_pos = pos;
            break;
        }
    }
    snippet_around(body, best_pos, max_len)
}

/// Window of `max_len` bytes around `pos`, trimmed to char boundaries with
/// ellipses on cut edges.
fn snippet_around(body: &str, pos: usize, max_len: usize) -> String {
    let start = floor_char_boundary(body, pos.saturating_sub(50));
    let end = floor_char_boundary(body, (start + max_len).min(body.len()));

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.push_str(body[start..end].trim());
    if end < body.len() {
        snippet.push_str("...");
    }
    snippet
}
