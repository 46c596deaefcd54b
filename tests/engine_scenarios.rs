//! End-to-end scenarios against the public engine surface.

use async_trait::async_trait;
use std::io::Write;
use std::sync::{Arc, Mutex};

use openclaw_lcm::db::{NewSummary, SummarySources};
use openclaw_lcm::provider::{SummarizeOptions, Summarizer};
use openclaw_lcm::{
    CompactMode, ContentBlock, ContextEngine, FALLBACK_MARKER, IncomingMessage, LcmConfig, Result,
    Role,
};

/// Summarizer that always shrinks input to a short digest.
struct ShrinkingSummarizer;

#[async_trait]
impl Summarizer for ShrinkingSummarizer {
    async fn summarize(
        &self,
        _text: &str,
        _aggressive: bool,
        _opts: &SummarizeOptions,
    ) -> Result<String> {
        Ok("digest of earlier conversation".into())
    }
}

/// Summarizer with a scripted response per call.
struct ScriptedSummarizer {
    script: Mutex<Vec<String>>,
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(
        &self,
        _text: &str,
        _aggressive: bool,
        _opts: &SummarizeOptions,
    ) -> Result<String> {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            Ok(String::new())
        } else {
            Ok(script.remove(0))
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn test_config() -> LcmConfig {
    LcmConfig {
        database_path: ":memory:".into(),
        large_file_root: Some(std::env::temp_dir().join("lcm-scenario-tests")),
        ..LcmConfig::default()
    }
}

fn compaction_config() -> LcmConfig {
    LcmConfig {
        leaf_chunk_tokens: 40,
        fresh_tail_count: 1,
        leaf_min_fanout: 2,
        condensed_min_fanout: 2,
        condensed_min_fanout_hard: 2,
        ..test_config()
    }
}

async fn engine_with(config: LcmConfig, summarizer: Arc<dyn Summarizer>) -> ContextEngine {
    init_tracing();
    ContextEngine::new(config, summarizer).await.unwrap()
}

fn flat_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Three messages in, three turns out, in order, no summaries.
#[tokio::test]
async fn scenario_basic_ingest_and_assemble() {
    let engine = engine_with(test_config(), Arc::new(ShrinkingSummarizer)).await;
    engine.bootstrap("s1", None).await.unwrap();
    for (role, text) in [
        (Role::User, "hello"),
        (Role::Assistant, "hi"),
        (Role::User, "bye"),
    ] {
        engine
            .ingest("s1", IncomingMessage::new(role, text))
            .await
            .unwrap();
    }

    let out = engine.assemble("s1", 10_000).await.unwrap();
    assert_eq!(out.messages.len(), 3);
    assert_eq!(flat_text(&out.messages[0].blocks), "hello");
    assert_eq!(flat_text(&out.messages[1].blocks), "hi");
    assert_eq!(flat_text(&out.messages[2].blocks), "bye");
    assert!(out.messages.iter().all(|m| !flat_text(&m.blocks).starts_with("<summary")));
    assert!(out.total_tokens <= 10_000);
}

/// With a 40-token chunk and a one-message fresh tail, ten 20-token
/// messages trigger one leaf pass that collapses the oldest two.
#[tokio::test]
async fn scenario_leaf_compaction_triggers() {
    let engine = engine_with(compaction_config(), Arc::new(ShrinkingSummarizer)).await;
    for i in 0..10 {
        engine
            .ingest(
                "s2",
                IncomingMessage::user(format!("{i:02} {}", "pad ".repeat(19))),
            )
            .await
            .unwrap();
    }

    let result = engine.after_turn("s2").await.unwrap();
    assert!(result.did_work());
    assert_eq!(result.leaf_passes, 1);
    assert!(result.tokens_after < result.tokens_before);

    let conv = engine
        .conversations()
        .get_by_session("s2")
        .await
        .unwrap()
        .unwrap();
    let items = engine.context_items().list(conv.id).await.unwrap();
    assert_eq!(
        items[0].kind,
        openclaw_lcm::db::models::ContextItemKind::Summary
    );
    // The newest message stays raw.
    assert!(items.last().unwrap().message_id.is_some());

    // The summary turn is model-visible XML.
    let out = engine.assemble("s2", 100_000).await.unwrap();
    let first = flat_text(&out.messages[0].blocks);
    assert!(first.starts_with("<summary id=\"sum_"));
    assert!(first.contains("digest of earlier conversation"));
}

/// Empty then non-shrinking summarizer output escalates to the
/// deterministic truncation fallback with its marker.
#[tokio::test]
async fn scenario_escalation_to_truncation_fallback() {
    let scripted = ScriptedSummarizer {
        // First (normal) call: empty. Second (aggressive): a 200-token echo
        // that cannot shrink anything.
        script: Mutex::new(vec![String::new(), "echo ".repeat(160)]),
    };
    let engine = engine_with(compaction_config(), Arc::new(scripted)).await;
    for i in 0..6 {
        engine
            .ingest(
                "s3",
                IncomingMessage::user(format!("{i:02} {}", "pad ".repeat(19))),
            )
            .await
            .unwrap();
    }

    let result = engine.after_turn("s3").await.unwrap();
    assert!(result.did_work());

    let summary = engine
        .summaries()
        .get(&result.summaries_created[0])
        .await
        .unwrap()
        .unwrap();
    assert!(summary.content.contains(FALLBACK_MARKER));
    // The fallback preserves a prefix of the real input.
    assert!(summary.content.contains("00"));
}

/// Eight leaves under four depth-1 nodes condense into exactly one
/// depth-2 node counting all twelve ancestors.
#[tokio::test]
async fn scenario_condensation_to_depth_two() {
    let config = LcmConfig {
        leaf_chunk_tokens: 40,
        fresh_tail_count: 1,
        leaf_min_fanout: 8,
        condensed_min_fanout: 4,
        condensed_min_fanout_hard: 2,
        ..test_config()
    };
    let engine = engine_with(config, Arc::new(ShrinkingSummarizer)).await;
    for i in 0..17 {
        engine
            .ingest("s4", IncomingMessage::user(format!("message {i:02} body")))
            .await
            .unwrap();
    }
    let conv = engine
        .conversations()
        .get_by_session("s4")
        .await
        .unwrap()
        .unwrap();

    // Build the precondition shape through the stores: 8 leaves over message
    // pairs, then 4 depth-1 nodes over leaf pairs.
    let mut leaf_ids = Vec::new();
    for i in 0..8 {
        let items = engine.context_items().list(conv.id).await.unwrap();
        let start = i + 1;
        let pair: Vec<i64> = items[start - 1..start + 1]
            .iter()
            .filter_map(|it| it.message_id)
            .collect();
        let leaf = engine
            .summaries()
            .create(NewSummary {
                conversation_id: conv.id,
                content: format!("leaf {i}"),
                sources: SummarySources::Messages(pair),
            })
            .await
            .unwrap();
        engine
            .context_items()
            .replace_range(conv.id, start as i64, (start + 1) as i64, leaf.id.clone())
            .await
            .unwrap();
        leaf_ids.push(leaf.id);
    }
    for i in 0..4 {
        let d1 = engine
            .summaries()
            .create(NewSummary {
                conversation_id: conv.id,
                content: format!("d1 {i}"),
                sources: SummarySources::Parents(leaf_ids[i * 2..i * 2 + 2].to_vec()),
            })
            .await
            .unwrap();
        engine
            .context_items()
            .replace_range(conv.id, (i + 1) as i64, (i + 2) as i64, d1.id)
            .await
            .unwrap();
    }

    let result = engine.compact("s4", CompactMode::Full).await.unwrap();
    assert_eq!(result.condense_passes, 1);
    let top = engine
        .summaries()
        .get(result.summaries_created.last().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(top.depth, 2);
    assert_eq!(top.descendant_count, 12);
}

/// Duplicate and orphan tool results are repaired in assembly.
#[tokio::test]
async fn scenario_tool_pairing_repair() {
    let engine = engine_with(test_config(), Arc::new(ShrinkingSummarizer)).await;
    engine
        .ingest(
            "s5",
            IncomingMessage::assistant("").with_parts(vec![serde_json::json!({
                "type": "tool_call", "id": "A", "name": "lookup", "input": {}
            })]),
        )
        .await
        .unwrap();
    engine
        .ingest("s5", IncomingMessage::assistant("just text"))
        .await
        .unwrap();
    for id in ["A", "B", "A"] {
        engine
            .ingest(
                "s5",
                IncomingMessage::new(Role::Tool, "").with_parts(vec![serde_json::json!({
                    "type": "tool_result", "tool_call_id": id, "content": "result", "is_error": false
                })]),
            )
            .await
            .unwrap();
    }

    let out = engine.assemble("s5", 100_000).await.unwrap();
    assert_eq!(out.messages.len(), 3);
    assert!(matches!(
        &out.messages[0].blocks[0],
        ContentBlock::ToolCall { id, .. } if id == "A"
    ));
    assert!(matches!(
        &out.messages[1].blocks[0],
        ContentBlock::ToolResult { tool_call_id, .. } if tool_call_id == "A"
    ));
    assert_eq!(flat_text(&out.messages[2].blocks), "just text");
}

/// Bootstrap imports exactly the transcript messages missing from the
/// store, preserving seq; reruns import nothing.
#[tokio::test]
async fn round_trip_bootstrap_reimports_missing_tail() {
    let engine = engine_with(test_config(), Arc::new(ShrinkingSummarizer)).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"seq":1,"role":"user","content":"alpha"}}"#).unwrap();
    writeln!(file, r#"{{"seq":2,"role":"assistant","content":"beta"}}"#).unwrap();
    writeln!(file, r#"{{"seq":3,"role":"user","content":"gamma"}}"#).unwrap();
    file.flush().unwrap();

    let first = engine.bootstrap("r1", Some(file.path())).await.unwrap();
    assert!(first.created);
    assert_eq!(first.imported, 3);

    // Clean shutdown, new lines appear in the host transcript.
    writeln!(file, r#"{{"seq":4,"role":"assistant","content":"delta"}}"#).unwrap();
    writeln!(file, r#"{{"seq":5,"role":"user","content":"epsilon"}}"#).unwrap();
    file.flush().unwrap();

    let second = engine.bootstrap("r1", Some(file.path())).await.unwrap();
    assert!(!second.created);
    assert_eq!(second.imported, 2);

    let conv = engine
        .conversations()
        .get_by_session("r1")
        .await
        .unwrap()
        .unwrap();
    let msgs = engine.messages().list(conv.id).await.unwrap();
    assert_eq!(msgs.len(), 5);
    assert_eq!(msgs.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    assert_eq!(msgs[4].content, "epsilon");

    // A third run with an unchanged transcript is a no-op.
    let third = engine.bootstrap("r1", Some(file.path())).await.unwrap();
    assert_eq!(third.imported, 0);
}

/// A store with history that shares nothing with the transcript refuses to
/// bootstrap rather than truncate.
#[tokio::test]
async fn bootstrap_refuses_divergent_histories() {
    let engine = engine_with(test_config(), Arc::new(ShrinkingSummarizer)).await;
    engine
        .ingest("r1b", IncomingMessage::user("stored original"))
        .await
        .unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"seq":1,"role":"user","content":"rewritten elsewhere"}}"#).unwrap();
    file.flush().unwrap();

    let err = engine.bootstrap("r1b", Some(file.path())).await.unwrap_err();
    assert_eq!(
        err.code(),
        openclaw_lcm::ErrorCode::ReconciliationRequired
    );
}

/// Assembled output fits the budget unless the fresh tail alone
/// overflows it, in which case the tail comes back whole.
#[tokio::test]
async fn assembly_budget_honored_with_tail_deviation() {
    let config = LcmConfig {
        fresh_tail_count: 2,
        ..test_config()
    };
    let engine = engine_with(config, Arc::new(ShrinkingSummarizer)).await;
    for i in 0..8 {
        engine
            .ingest("p7", IncomingMessage::user(format!("{i} {}", "word ".repeat(30))))
            .await
            .unwrap();
    }

    let fitting = engine.assemble("p7", 120).await.unwrap();
    assert!(fitting.total_tokens <= 120);

    let overflowing = engine.assemble("p7", 5).await.unwrap();
    assert_eq!(overflowing.messages.len(), 2, "tail survives in full");
    assert!(overflowing.total_tokens > 5);
}

/// Full sweep then unlimited assembly: every surviving summary's sources
/// remain reachable in the store (nothing was hard-deleted).
#[tokio::test]
async fn compaction_never_discards_messages() {
    let engine = engine_with(compaction_config(), Arc::new(ShrinkingSummarizer)).await;
    for i in 0..12 {
        engine
            .ingest(
                "keep",
                IncomingMessage::user(format!("{i:02} {}", "pad ".repeat(19))),
            )
            .await
            .unwrap();
    }
    let result = engine.compact("keep", CompactMode::Full).await.unwrap();
    assert!(result.did_work());

    let conv = engine
        .conversations()
        .get_by_session("keep")
        .await
        .unwrap()
        .unwrap();
    let msgs = engine.messages().list(conv.id).await.unwrap();
    assert_eq!(msgs.len(), 12, "raw messages survive compaction");

    // And every created summary resolves back to real source messages.
    for id in &result.summaries_created {
        let sources = engine.summaries().source_messages(id, 10).await.unwrap();
        assert!(!sources.is_empty());
    }
}
