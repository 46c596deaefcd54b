//! Assembler
//!
//! Materializes the model-visible message array from the context item stream
//! under a token budget. The fresh tail is always included in full; the
//! remaining budget is filled from the evictable prefix newest-first; the
//! final sequence gets tool-pairing repair. Deterministic given its inputs.

mod content;
mod pairing;

pub use content::{AssembledTurn, ContentBlock};
pub use pairing::repair_tool_pairing;

use crate::config::LcmConfig;
use crate::db::models::{ContextItemKind, StoredPart};
use crate::db::{Database, context_items, messages, summaries};
use crate::error::{LcmError, Result};

/// Output of one assembly.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub messages: Vec<AssembledTurn>,
    pub total_tokens: i64,
}

pub struct Assembler {
    db: Database,
    config: LcmConfig,
}

struct MaterializedItem {
    turn: AssembledTurn,
    tokens: i64,
    is_message: bool,
}

impl Assembler {
    pub fn new(db: Database, config: LcmConfig) -> Self {
        Self { db, config }
    }

    pub async fn assemble(&self, conversation_id: i64, budget_tokens: i64) -> Result<Assembled> {
        if budget_tokens <= 0 {
            return Err(LcmError::Input(format!(
                "assembly budget must be positive, got {budget_tokens}"
            )));
        }

        let materialized: Vec<MaterializedItem> = self
            .db
            .interact(move |conn| {
                let items = context_items::list_sequenced_tx(conn, conversation_id)?;
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    let turn = match item.kind {
                        ContextItemKind::Message => {
                            let id = item.message_id.ok_or_else(|| {
                                LcmError::Invariant("message item without message_id".into())
                            })?;
                            let msg = messages::fetch_by_ids_tx(conn, &[id])?
                                .pop()
                                .expect("fetch_by_ids_tx errors on missing rows");
                            let parts: Vec<_> = messages::parts_for_messages_tx(conn, &[id])?
                                .remove(&id)
                                .unwrap_or_default()
                                .into_iter()
                                .map(|p: StoredPart| p.part)
                                .collect();
                            AssembledTurn {
                                role: msg.role,
                                blocks: content::blocks_from_parts(&msg.content, &parts),
                                stop_reason: msg.stop_reason.clone(),
                            }
                        }
                        ContextItemKind::Summary => {
                            let id = item.summary_id.as_deref().ok_or_else(|| {
                                LcmError::Invariant("summary item without summary_id".into())
                            })?;
                            let summary = summaries::get_tx(conn, id)?
                                .ok_or_else(|| LcmError::NotFound(format!("summary {id}")))?;
                            let parent_ids: Vec<String> = summaries::parents_tx(conn, id)?
                                .into_iter()
                                .map(|p| p.id)
                                .collect();
                            content::summary_turn(&summary, &parent_ids)
                        }
                    };
                    out.push(MaterializedItem {
                        tokens: turn.token_count(),
                        is_message: item.is_message(),
                        turn,
                    });
                }
                Ok(out)
            })
            .await?;

        // Fresh tail: the last `fresh_tail_count` message-typed items.
        let tail_start = {
            let mut seen = 0usize;
            let mut idx = materialized.len();
            if self.config.fresh_tail_count > 0 {
                for (i, item) in materialized.iter().enumerate().rev() {
                    if item.is_message {
                        seen += 1;
                        if seen == self.config.fresh_tail_count {
                            idx = i;
                            break;
                        }
                    }
                }
                if seen > 0 && seen < self.config.fresh_tail_count {
                    idx = 0;
                }
            }
            idx
        };

        let tail_tokens: i64 = materialized[tail_start..].iter().map(|m| m.tokens).sum();
        if tail_tokens > budget_tokens {
            tracing::warn!(
                "fresh tail ({tail_tokens} tokens) exceeds assembly budget ({budget_tokens}); \
                 returning the tail in full"
            );
        }

        // Fill what remains newest-first from the evictable prefix, keeping a
        // contiguous suffix so ordinal order survives.
        let mut remaining = budget_tokens - tail_tokens;
        let mut keep_from = tail_start;
        for (i, item) in materialized[..tail_start].iter().enumerate().rev() {
            if remaining < item.tokens {
                break;
            }
            remaining -= item.tokens;
            keep_from = i;
        }
        if keep_from > 0 {
            tracing::debug!(
                "assembly dropped {} oldest items to fit budget {budget_tokens}",
                keep_from
            );
        }

        let kept: Vec<AssembledTurn> = materialized
            .into_iter()
            .skip(keep_from)
            .map(|m| m.turn)
            .collect();
        let repaired = repair_tool_pairing(kept);
        let total_tokens = repaired.iter().map(AssembledTurn::token_count).sum();

        Ok(Assembled {
            messages: repaired,
            total_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{MessagePart, Role};
    use crate::db::{
        ContextItemRepository, ConversationRepository, MessageRepository, NewSummary,
        SummaryRepository, SummarySources,
    };
    use serde_json::json;

    struct Fixture {
        assembler: Assembler,
        items: ContextItemRepository,
        messages: MessageRepository,
        summaries: SummaryRepository,
        conv: i64,
    }

    async fn setup(fresh_tail_count: usize) -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let (conv, _) = ConversationRepository::new(db.clone())
            .get_or_create("sess-assemble")
            .await
            .unwrap();
        let config = LcmConfig {
            fresh_tail_count,
            ..LcmConfig::default()
        };
        Fixture {
            assembler: Assembler::new(db.clone(), config),
            items: ContextItemRepository::new(db.clone()),
            messages: MessageRepository::new(db.clone()),
            summaries: SummaryRepository::new(db),
            conv: conv.id,
        }
    }

    async fn ingest(f: &Fixture, role: Role, content: &str) -> i64 {
        let msg = f
            .messages
            .append(f.conv, role, content.into(), None, None, vec![])
            .await
            .unwrap();
        f.items.append_message(f.conv, msg.id).await.unwrap();
        msg.id
    }

    fn turn_text(turn: &AssembledTurn) -> String {
        turn.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_basic_ingest_and_assemble_in_order() {
        let f = setup(8).await;
        ingest(&f, Role::User, "hello").await;
        ingest(&f, Role::Assistant, "hi").await;
        ingest(&f, Role::User, "bye").await;

        let out = f.assembler.assemble(f.conv, 10_000).await.unwrap();
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[0].role, Role::User);
        assert_eq!(turn_text(&out.messages[0]), "hello");
        assert_eq!(out.messages[1].role, Role::Assistant);
        assert_eq!(turn_text(&out.messages[2]), "bye");
        assert!(out.total_tokens <= 10_000);
    }

    #[tokio::test]
    async fn test_summary_items_become_xml_user_turns() {
        let f = setup(1).await;
        let m1 = ingest(&f, Role::User, "first part of the story").await;
        let m2 = ingest(&f, Role::User, "second part of the story").await;
        ingest(&f, Role::User, "the fresh one").await;

        let summary = f
            .summaries
            .create(NewSummary {
                conversation_id: f.conv,
                content: "the story so far".into(),
                sources: SummarySources::Messages(vec![m1, m2]),
            })
            .await
            .unwrap();
        f.items
            .replace_range(f.conv, 1, 2, summary.id.clone())
            .await
            .unwrap();

        let out = f.assembler.assemble(f.conv, 10_000).await.unwrap();
        assert_eq!(out.messages.len(), 2);
        let xml = turn_text(&out.messages[0]);
        assert!(xml.starts_with("<summary id=\""));
        assert!(xml.contains(&summary.id));
        assert!(xml.contains("the story so far"));
        assert_eq!(out.messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_budget_drops_oldest_first_keeps_tail() {
        let f = setup(2).await;
        for i in 0..6 {
            ingest(&f, Role::User, &format!("message number {i} {}", "pad ".repeat(20))).await;
        }
        // Each message is ~25 tokens; budget fits the tail plus ~one more.
        let out = f.assembler.assemble(f.conv, 80).await.unwrap();
        assert!(out.messages.len() >= 2, "fresh tail always survives");
        assert!(out.messages.len() < 6, "old items must be dropped");
        let last = turn_text(out.messages.last().unwrap());
        assert!(last.contains("number 5"));
        assert!(out.total_tokens <= 80);
    }

    #[tokio::test]
    async fn test_fresh_tail_returned_even_over_budget() {
        let f = setup(2).await;
        ingest(&f, Role::User, &"old ".repeat(100)).await;
        ingest(&f, Role::User, &"tail one ".repeat(100)).await;
        ingest(&f, Role::User, &"tail two ".repeat(100)).await;

        let out = f.assembler.assemble(f.conv, 10).await.unwrap();
        assert_eq!(out.messages.len(), 2);
        assert!(out.total_tokens > 10, "documented deviation: tail in full");
    }

    #[tokio::test]
    async fn test_assistant_parts_are_reconstructed() {
        let f = setup(8).await;
        let msg = f
            .messages
            .append(
                f.conv,
                Role::Assistant,
                "flat".into(),
                None,
                None,
                vec![
                    MessagePart::Text {
                        text: "calling".into(),
                    },
                    MessagePart::ToolCall {
                        id: "c9".into(),
                        name: "lookup".into(),
                        input: json!({"k": "v"}),
                    },
                ],
            )
            .await
            .unwrap();
        f.items.append_message(f.conv, msg.id).await.unwrap();

        let out = f.assembler.assemble(f.conv, 10_000).await.unwrap();
        // Tool-pairing repair synthesizes the missing result for c9.
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].blocks.len(), 2);
        assert!(matches!(
            &out.messages[0].blocks[1],
            ContentBlock::ToolCall { id, .. } if id == "c9"
        ));
        assert!(out.messages[1].is_tool_result_turn());
    }

    #[tokio::test]
    async fn test_tool_pairing_repair_applies_end_to_end() {
        let f = setup(8).await;
        let call = f
            .messages
            .append(
                f.conv,
                Role::Assistant,
                "".into(),
                None,
                None,
                vec![MessagePart::ToolCall {
                    id: "A".into(),
                    name: "t".into(),
                    input: json!({}),
                }],
            )
            .await
            .unwrap();
        f.items.append_message(f.conv, call.id).await.unwrap();
        // Orphan result for a different id.
        let orphan = f
            .messages
            .append(
                f.conv,
                Role::Tool,
                "".into(),
                None,
                None,
                vec![MessagePart::ToolResult {
                    tool_call_id: "B".into(),
                    content: json!("stray"),
                    is_error: false,
                }],
            )
            .await
            .unwrap();
        f.items.append_message(f.conv, orphan.id).await.unwrap();
        let real = f
            .messages
            .append(
                f.conv,
                Role::Tool,
                "".into(),
                None,
                None,
                vec![MessagePart::ToolResult {
                    tool_call_id: "A".into(),
                    content: json!("answer"),
                    is_error: false,
                }],
            )
            .await
            .unwrap();
        f.items.append_message(f.conv, real.id).await.unwrap();

        let out = f.assembler.assemble(f.conv, 10_000).await.unwrap();
        assert_eq!(out.messages.len(), 2);
        let ContentBlock::ToolResult { tool_call_id, .. } = &out.messages[1].blocks[0] else {
            panic!("expected result turn");
        };
        assert_eq!(tool_call_id, "A");
    }

    #[tokio::test]
    async fn test_rejects_nonpositive_budget() {
        let f = setup(8).await;
        assert!(f.assembler.assemble(f.conv, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_assembly_is_deterministic() {
        let f = setup(2).await;
        for i in 0..5 {
            ingest(&f, Role::User, &format!("repeatable {i}")).await;
        }
        let a = f.assembler.assemble(f.conv, 60).await.unwrap();
        let b = f.assembler.assemble(f.conv, 60).await.unwrap();
        assert_eq!(a.messages, b.messages);
        assert_eq!(a.total_tokens, b.total_tokens);
    }
}
