//! Compaction Engine
//!
//! Decides when to summarize, which contiguous range to collapse, at what
//! depth, and how to recover from degenerate summarizer output. Every pass is
//! one atomic replacement: insert a summary node, swap it into the context
//! stream, renumber. A pass commits only when it strictly reduces context
//! tokens, or when it is a deterministic fallback over an irreducible
//! segment — so every sweep makes monotone progress and terminates.

mod escalate;
mod passes;

pub use escalate::FALLBACK_MARKER;

use chrono::SecondsFormat;
use std::sync::Arc;

use crate::config::LcmConfig;
use crate::db::models::{Message, Summary};
use crate::db::{Database, NewSummary, SummarySources, context_items, messages, summaries};
use crate::error::Result;
use crate::provider::Summarizer;
use crate::tokenizer::estimate_tokens;
use escalate::{
    aggressive_leaf_target, condensed_target, fallback_summary, leaf_target,
    summarize_with_escalation,
};
use passes::{Run, raw_tokens_outside_tail, select_condense_run, select_leaf_run,
    shallowest_eligible_depth};

/// Compaction variants exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactMode {
    /// One leaf pass plus bounded condensation, gated by the trigger.
    Incremental,
    /// Leaf passes to exhaustion, then condensation to exhaustion.
    Full,
    /// Repeated full sweeps under budget pressure until the stream fits.
    BudgetTo(i64),
}

/// Outcome of one compaction invocation.
#[derive(Debug, Clone)]
pub struct CompactResult {
    pub mode: CompactMode,
    pub leaf_passes: usize,
    pub condense_passes: usize,
    pub tokens_before: i64,
    pub tokens_after: i64,
    pub summaries_created: Vec<String>,
}

impl CompactResult {
    fn new(mode: CompactMode, tokens_before: i64) -> Self {
        Self {
            mode,
            leaf_passes: 0,
            condense_passes: 0,
            tokens_before,
            tokens_after: tokens_before,
            summaries_created: Vec::new(),
        }
    }

    /// Result for a call that never ran (engine disabled).
    pub(crate) fn noop(mode: CompactMode) -> Self {
        Self::new(mode, 0)
    }

    pub fn did_work(&self) -> bool {
        !self.summaries_created.is_empty()
    }
}

pub struct CompactionEngine {
    db: Database,
    config: LcmConfig,
    summarizer: Arc<dyn Summarizer>,
}

struct LeafSelection {
    run: Run,
    input: String,
    previous: String,
}

struct CondenseSelection {
    run: Run,
    input: String,
    previous: String,
}

impl CompactionEngine {
    pub fn new(db: Database, config: LcmConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            db,
            config,
            summarizer,
        }
    }

    /// Run one compaction invocation. The caller holds the conversation's
    /// serializer lane; nothing else mutates the stream while this runs.
    pub async fn run(&self, conversation_id: i64, mode: CompactMode) -> Result<CompactResult> {
        let tokens_before = self.total_tokens(conversation_id).await?;
        let mut result = CompactResult::new(mode, tokens_before);

        match mode {
            CompactMode::Incremental => self.incremental(conversation_id, &mut result).await?,
            CompactMode::Full => self.full_sweep(conversation_id, false, &mut result).await?,
            CompactMode::BudgetTo(target) => {
                self.budget_sweep(conversation_id, target, &mut result).await?
            }
        }

        result.tokens_after = self.total_tokens(conversation_id).await?;
        if result.did_work() {
            tracing::info!(
                "compaction ({mode:?}) on conversation {conversation_id}: \
                 {} leaf + {} condense passes, {} -> {} tokens",
                result.leaf_passes,
                result.condense_passes,
                result.tokens_before,
                result.tokens_after,
            );
        }
        Ok(result)
    }

    /// Per-turn pass: when enough raw tokens sit outside the fresh tail, run
    /// exactly one leaf pass, then up to `incremental_max_depth` condensation
    /// passes.
    async fn incremental(&self, conversation_id: i64, result: &mut CompactResult) -> Result<()> {
        let fresh_tail = self.config.fresh_tail_count;
        let chunk = self.config.leaf_chunk_tokens;
        let triggered = self
            .db
            .interact(move |conn| {
                let items = context_items::list_sequenced_tx(conn, conversation_id)?;
                Ok(raw_tokens_outside_tail(&items, fresh_tail) >= chunk)
            })
            .await?;
        if !triggered {
            return Ok(());
        }

        if let Some(id) = self.leaf_pass(conversation_id).await? {
            result.leaf_passes += 1;
            result.summaries_created.push(id);
        }

        for _ in 0..self.config.incremental_max_depth {
            match self.next_condense_pass(conversation_id, false).await? {
                Some(id) => {
                    result.condense_passes += 1;
                    result.summaries_created.push(id);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Phase 1: leaf passes until none is eligible. Phase 2: condensation
    /// from the shallowest eligible depth until none is eligible.
    async fn full_sweep(
        &self,
        conversation_id: i64,
        pressure: bool,
        result: &mut CompactResult,
    ) -> Result<()> {
        while let Some(id) = self.leaf_pass(conversation_id).await? {
            result.leaf_passes += 1;
            result.summaries_created.push(id);
        }
        while let Some(id) = self.next_condense_pass(conversation_id, pressure).await? {
            result.condense_passes += 1;
            result.summaries_created.push(id);
        }
        Ok(())
    }

    /// Repeat full sweeps (with hard fanout) until the stream fits `target`
    /// or a round makes no progress, bounded by `max_budget_rounds`.
    async fn budget_sweep(
        &self,
        conversation_id: i64,
        target: i64,
        result: &mut CompactResult,
    ) -> Result<()> {
        for round in 1..=self.config.max_budget_rounds {
            let total = self.total_tokens(conversation_id).await?;
            if total <= target {
                break;
            }
            let created_before = result.summaries_created.len();
            self.full_sweep(conversation_id, true, result).await?;
            if result.summaries_created.len() == created_before {
                tracing::debug!(
                    "budget sweep round {round} made no progress at {total} tokens (target {target})"
                );
                break;
            }
        }
        Ok(())
    }

    /// One leaf pass. Returns the created summary id, or `None` when no run
    /// is eligible.
    async fn leaf_pass(&self, conversation_id: i64) -> Result<Option<String>> {
        let fresh_tail = self.config.fresh_tail_count;
        let chunk = self.config.leaf_chunk_tokens;

        let selection: Option<LeafSelection> = self
            .db
            .interact(move |conn| {
                let items = context_items::list_sequenced_tx(conn, conversation_id)?;
                let Some(run) = select_leaf_run(&items, fresh_tail, chunk) else {
                    return Ok(None);
                };
                let msgs = messages::fetch_by_ids_tx(conn, &run.message_ids)?;
                let previous = summaries::latest_at_depth_tx(conn, conversation_id, 0)?
                    .map(|s| s.content)
                    .unwrap_or_default();
                Ok(Some(LeafSelection {
                    input: build_leaf_input(&msgs),
                    run,
                    previous,
                }))
            })
            .await?;
        let Some(selection) = selection else {
            return Ok(None);
        };

        let input_tokens = estimate_tokens(&selection.input);
        let normal_target = leaf_target(input_tokens);
        let outcome = summarize_with_escalation(
            self.summarizer.as_ref(),
            &selection.input,
            selection.previous,
            false,
            None,
            normal_target,
            aggressive_leaf_target(input_tokens),
        )
        .await?;

        // Strict-progress demotion: a summary at least as large as the run it
        // replaces marks the segment irreducible.
        let (content, fallback) = if !outcome.fallback
            && estimate_tokens(&outcome.content) >= selection.run.token_sum
        {
            (fallback_summary(&selection.input, normal_target), true)
        } else {
            (outcome.content, outcome.fallback)
        };

        let run = selection.run;
        let id = self
            .db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let summary = summaries::create_tx(
                    &tx,
                    &NewSummary {
                        conversation_id,
                        content,
                        sources: SummarySources::Messages(run.message_ids.clone()),
                    },
                )?;
                context_items::replace_range_tx(
                    &tx,
                    conversation_id,
                    run.start_ordinal,
                    run.end_ordinal,
                    &summary.id,
                )?;
                tx.commit()?;
                tracing::debug!(
                    "leaf pass collapsed ordinals [{}, {}] ({} tokens) into {} ({} tokens{})",
                    run.start_ordinal,
                    run.end_ordinal,
                    run.token_sum,
                    summary.id,
                    summary.token_count,
                    if fallback { ", fallback" } else { "" },
                );
                Ok(summary.id)
            })
            .await?;
        Ok(Some(id))
    }

    /// One condensation pass at the shallowest eligible depth. Returns the
    /// created summary id, or `None` when no depth is eligible.
    async fn next_condense_pass(
        &self,
        conversation_id: i64,
        pressure: bool,
    ) -> Result<Option<String>> {
        let fresh_tail = self.config.fresh_tail_count;
        let leaf_fanout = self.config.leaf_min_fanout;
        let condensed_fanout = if pressure {
            self.config.condensed_min_fanout_hard
        } else {
            self.config.condensed_min_fanout
        };
        let min_fanout = move |d: i64| {
            if d == 0 { leaf_fanout } else { condensed_fanout }
        };

        let selection: Option<(i64, CondenseSelection)> = self
            .db
            .interact(move |conn| {
                let items = context_items::list_sequenced_tx(conn, conversation_id)?;
                let Some(depth) = shallowest_eligible_depth(&items, fresh_tail, min_fanout) else {
                    return Ok(None);
                };
                let run = select_condense_run(&items, fresh_tail, depth, min_fanout(depth))
                    .expect("depth was just reported eligible");
                let mut members = Vec::with_capacity(run.summary_ids.len());
                for id in &run.summary_ids {
                    members.push(summaries::get_tx(conn, id)?.ok_or_else(|| {
                        crate::error::LcmError::NotFound(format!("summary {id}"))
                    })?);
                }
                let previous = summaries::latest_at_depth_tx(conn, conversation_id, depth + 1)?
                    .map(|s| s.content)
                    .unwrap_or_default();
                Ok(Some((
                    depth,
                    CondenseSelection {
                        input: build_condense_input(&members),
                        run,
                        previous,
                    },
                )))
            })
            .await?;
        let Some((depth, selection)) = selection else {
            return Ok(None);
        };

        let target = condensed_target(self.config.condensed_target_tokens);
        let outcome = summarize_with_escalation(
            self.summarizer.as_ref(),
            &selection.input,
            selection.previous,
            true,
            Some(depth + 1),
            target,
            target,
        )
        .await?;

        let (content, fallback) = if !outcome.fallback
            && estimate_tokens(&outcome.content) >= selection.run.token_sum
        {
            (fallback_summary(&selection.input, target), true)
        } else {
            (outcome.content, outcome.fallback)
        };

        let run = selection.run;
        let id = self
            .db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let summary = summaries::create_tx(
                    &tx,
                    &NewSummary {
                        conversation_id,
                        content,
                        sources: SummarySources::Parents(run.summary_ids.clone()),
                    },
                )?;
                context_items::replace_range_tx(
                    &tx,
                    conversation_id,
                    run.start_ordinal,
                    run.end_ordinal,
                    &summary.id,
                )?;
                tx.commit()?;
                tracing::debug!(
                    "condensed {} depth-{depth} summaries into {} (depth {}{})",
                    run.summary_ids.len(),
                    summary.id,
                    summary.depth,
                    if fallback { ", fallback" } else { "" },
                );
                Ok(summary.id)
            })
            .await?;
        Ok(Some(id))
    }

    async fn total_tokens(&self, conversation_id: i64) -> Result<i64> {
        self.db
            .interact(move |conn| context_items::total_tokens_tx(conn, conversation_id))
            .await
    }
}

/// Concatenate run messages with a timestamped header per message.
fn build_leaf_input(msgs: &[Message]) -> String {
    let mut out = String::new();
    for m in msgs {
        let ts = m.created_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        out.push_str(&format!("[{} @ {}]\n{}\n\n", m.role, ts, m.content));
    }
    out
}

/// Concatenate member summaries with time-range headers.
fn build_condense_input(members: &[Summary]) -> String {
    let mut out = String::new();
    for s in members {
        let earliest = s
            .earliest_or_created()
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let latest = s
            .latest_or_created()
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        out.push_str(&format!(
            "[summary {} depth {} spanning {} .. {}]\n{}\n\n",
            s.id, s.depth, earliest, latest, s.content
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Role;
    use crate::db::{
        ContextItemRepository, ConversationRepository, MessageRepository, SummaryRepository,
    };
    use crate::provider::SummarizeOptions;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Summarizer that shrinks any input to a fixed short string.
    struct ShrinkingSummarizer {
        pub calls: Mutex<Vec<SummarizeOptions>>,
    }

    impl ShrinkingSummarizer {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Summarizer for ShrinkingSummarizer {
        async fn summarize(
            &self,
            _text: &str,
            _aggressive: bool,
            opts: &SummarizeOptions,
        ) -> Result<String> {
            self.calls.lock().unwrap().push(opts.clone());
            Ok("s".into())
        }
    }

    struct Fixture {
        engine: CompactionEngine,
        items: ContextItemRepository,
        messages: MessageRepository,
        summaries: SummaryRepository,
        conv: i64,
    }

    async fn setup(mut config: LcmConfig, summarizer: Arc<dyn Summarizer>) -> Fixture {
        config.database_path = std::path::PathBuf::from(":memory:");
        let db = Database::connect_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let (conv, _) = ConversationRepository::new(db.clone())
            .get_or_create("sess-compact")
            .await
            .unwrap();
        Fixture {
            engine: CompactionEngine::new(db.clone(), config, summarizer),
            items: ContextItemRepository::new(db.clone()),
            messages: MessageRepository::new(db.clone()),
            summaries: SummaryRepository::new(db),
            conv: conv.id,
        }
    }

    async fn ingest_user_messages(f: &Fixture, n: usize, chars_each: usize) {
        for i in 0..n {
            let body = format!("{i:03} {}", "w".repeat(chars_each.saturating_sub(4)));
            let msg = f
                .messages
                .append(f.conv, Role::User, body, None, None, vec![])
                .await
                .unwrap();
            f.items.append_message(f.conv, msg.id).await.unwrap();
        }
    }

    fn small_config() -> LcmConfig {
        LcmConfig {
            leaf_chunk_tokens: 40,
            fresh_tail_count: 1,
            leaf_min_fanout: 2,
            condensed_min_fanout: 2,
            condensed_min_fanout_hard: 2,
            incremental_max_depth: 0,
            ..LcmConfig::default()
        }
    }

    #[tokio::test]
    async fn test_incremental_leaf_pass_triggers_and_replaces() {
        // 10 messages of ~20 tokens, chunk 40, tail 1: the oldest two collapse.
        let f = setup(small_config(), Arc::new(ShrinkingSummarizer::new())).await;
        ingest_user_messages(&f, 10, 80).await;

        let result = f
            .engine
            .run(f.conv, CompactMode::Incremental)
            .await
            .unwrap();
        assert_eq!(result.leaf_passes, 1);
        assert_eq!(result.condense_passes, 0);
        assert!(result.tokens_after < result.tokens_before);

        let items = f.items.list(f.conv).await.unwrap();
        assert_eq!(items[0].kind, crate::db::models::ContextItemKind::Summary);
        // 10 - 2 raw messages remain.
        assert_eq!(items.len(), 9);
    }

    #[tokio::test]
    async fn test_incremental_below_trigger_is_noop() {
        let f = setup(small_config(), Arc::new(ShrinkingSummarizer::new())).await;
        ingest_user_messages(&f, 2, 20).await;
        let result = f
            .engine
            .run(f.conv, CompactMode::Incremental)
            .await
            .unwrap();
        assert!(!result.did_work());
    }

    #[tokio::test]
    async fn test_full_sweep_exhausts_leaves_then_condenses() {
        let f = setup(small_config(), Arc::new(ShrinkingSummarizer::new())).await;
        ingest_user_messages(&f, 9, 80).await;

        let result = f.engine.run(f.conv, CompactMode::Full).await.unwrap();
        assert!(result.leaf_passes >= 2);
        assert!(result.condense_passes >= 1);

        // Stream shrank to summaries plus the protected tail message.
        let items = f.items.list(f.conv).await.unwrap();
        assert!(items.len() < 9);
        let last = items.last().unwrap();
        assert_eq!(last.kind, crate::db::models::ContextItemKind::Message);

        // The condensed node exists at depth >= 1.
        let top = f
            .summaries
            .get(result.summaries_created.last().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(top.depth >= 1);
    }

    #[tokio::test]
    async fn test_full_sweep_terminates_on_finite_input() {
        let f = setup(small_config(), Arc::new(ShrinkingSummarizer::new())).await;
        ingest_user_messages(&f, 30, 60).await;
        let result = f.engine.run(f.conv, CompactMode::Full).await.unwrap();
        // A second sweep finds nothing left to do.
        let again = f.engine.run(f.conv, CompactMode::Full).await.unwrap();
        assert!(result.did_work());
        assert!(!again.did_work());
    }

    #[tokio::test]
    async fn test_escalation_fallback_commits_marker_summary() {
        /// Empty on normal, non-shrinking echo on aggressive.
        struct DegenerateSummarizer;
        #[async_trait]
        impl Summarizer for DegenerateSummarizer {
            async fn summarize(
                &self,
                _text: &str,
                aggressive: bool,
                _opts: &SummarizeOptions,
            ) -> Result<String> {
                if aggressive {
                    Ok("echo ".repeat(400))
                } else {
                    Ok(String::new())
                }
            }
        }

        let f = setup(small_config(), Arc::new(DegenerateSummarizer)).await;
        ingest_user_messages(&f, 6, 80).await;

        let result = f
            .engine
            .run(f.conv, CompactMode::Incremental)
            .await
            .unwrap();
        assert_eq!(result.leaf_passes, 1);

        let summary = f
            .summaries
            .get(&result.summaries_created[0])
            .await
            .unwrap()
            .unwrap();
        assert!(summary.content.contains(FALLBACK_MARKER));
    }

    #[tokio::test]
    async fn test_summarizer_error_aborts_pass_without_commit() {
        struct BrokenSummarizer;
        #[async_trait]
        impl Summarizer for BrokenSummarizer {
            async fn summarize(
                &self,
                _text: &str,
                _aggressive: bool,
                _opts: &SummarizeOptions,
            ) -> Result<String> {
                Err(crate::error::LcmError::External("down".into()))
            }
        }

        let f = setup(small_config(), Arc::new(BrokenSummarizer)).await;
        ingest_user_messages(&f, 6, 80).await;
        let err = f.engine.run(f.conv, CompactMode::Incremental).await;
        assert!(err.is_err());
        // Nothing committed: the stream still holds 6 raw messages.
        assert_eq!(f.items.list(f.conv).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_condensation_reaches_depth_two_across_rounds() {
        // Round one leaves a depth-1 node behind; round two mints a second
        // one, and the same sweep then condenses the pair to depth 2.
        let f = setup(small_config(), Arc::new(ShrinkingSummarizer::new())).await;
        ingest_user_messages(&f, 5, 80).await;
        f.engine.run(f.conv, CompactMode::Full).await.unwrap();
        ingest_user_messages(&f, 4, 80).await;
        let result = f.engine.run(f.conv, CompactMode::Full).await.unwrap();

        let mut top: Option<Summary> = None;
        for id in &result.summaries_created {
            let s = f.summaries.get(id).await.unwrap().unwrap();
            if top.as_ref().is_none_or(|t| s.depth > t.depth) {
                top = Some(s);
            }
        }
        let top = top.expect("second sweep created summaries");
        assert_eq!(top.depth, 2);
        // Two depth-1 parents, each over two leaves: (2+1) + (2+1).
        assert_eq!(top.descendant_count, 6);
    }

    #[tokio::test]
    async fn test_full_sweep_condenses_prebuilt_depth_one_layer() {
        // Eight leaves paired into four depth-1 summaries sitting in the
        // stream; a sweep with fanout 4 produces exactly one depth-2 node
        // counting all twelve ancestors.
        let config = LcmConfig {
            leaf_chunk_tokens: 40,
            fresh_tail_count: 1,
            leaf_min_fanout: 8,
            condensed_min_fanout: 4,
            condensed_min_fanout_hard: 2,
            ..LcmConfig::default()
        };
        let f = setup(config, Arc::new(ShrinkingSummarizer::new())).await;
        ingest_user_messages(&f, 17, 20).await;

        // Hand-build the shape: 8 leaves over message pairs…
        let mut leaf_ids = Vec::new();
        for i in 0..8 {
            let items = f.items.list(f.conv).await.unwrap();
            let start = (i + 1) as usize;
            let pair: Vec<i64> = items[start - 1..start + 1]
                .iter()
                .filter_map(|it| it.message_id)
                .collect();
            let leaf = f
                .summaries
                .create(crate::db::NewSummary {
                    conversation_id: f.conv,
                    content: format!("leaf {i}"),
                    sources: SummarySources::Messages(pair),
                })
                .await
                .unwrap();
            f.items
                .replace_range(f.conv, (i + 1) as i64, (i + 2) as i64, leaf.id.clone())
                .await
                .unwrap();
            leaf_ids.push(leaf.id);
        }
        // …then 4 depth-1 nodes over leaf pairs.
        for i in 0..4 {
            let parents = leaf_ids[i * 2..i * 2 + 2].to_vec();
            let d1 = f
                .summaries
                .create(crate::db::NewSummary {
                    conversation_id: f.conv,
                    content: format!("d1 {i}"),
                    sources: SummarySources::Parents(parents),
                })
                .await
                .unwrap();
            f.items
                .replace_range(f.conv, (i + 1) as i64, (i + 2) as i64, d1.id)
                .await
                .unwrap();
        }

        let result = f.engine.run(f.conv, CompactMode::Full).await.unwrap();
        assert_eq!(result.condense_passes, 1);
        let top = f
            .summaries
            .get(result.summaries_created.last().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(top.depth, 2);
        assert_eq!(top.descendant_count, 12);
    }

    #[tokio::test]
    async fn test_budget_sweep_stops_at_target() {
        let f = setup(small_config(), Arc::new(ShrinkingSummarizer::new())).await;
        ingest_user_messages(&f, 12, 80).await;

        let result = f
            .engine
            .run(f.conv, CompactMode::BudgetTo(60))
            .await
            .unwrap();
        assert!(result.did_work());
        assert!(result.tokens_after <= 60 || result.tokens_after < result.tokens_before);
    }

    #[tokio::test]
    async fn test_previous_summary_is_threaded() {
        let summarizer = Arc::new(ShrinkingSummarizer::new());
        let f = setup(small_config(), summarizer.clone()).await;
        ingest_user_messages(&f, 10, 80).await;
        f.engine
            .run(f.conv, CompactMode::Incremental)
            .await
            .unwrap();
        ingest_user_messages(&f, 10, 80).await;
        f.engine
            .run(f.conv, CompactMode::Incremental)
            .await
            .unwrap();

        let calls = summarizer.calls.lock().unwrap();
        assert!(calls.len() >= 2);
        assert!(calls[0].previous_summary.is_empty());
        // Second leaf pass sees the first leaf summary.
        assert_eq!(calls.last().unwrap().previous_summary, "s");
    }
}
