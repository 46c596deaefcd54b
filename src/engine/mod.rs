//! Context Engine
//!
//! The host-facing facade: bootstrap, ingest, per-turn compaction, assembly
//! and retrieval over one embedded store. Mutating operations are serialized
//! per conversation; reads see transactional snapshots and never queue.

mod serializer;

pub use serializer::ConversationSerializer;

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use crate::assemble::{Assembled, Assembler};
use crate::compaction::{CompactMode, CompactResult, CompactionEngine};
use crate::config::LcmConfig;
use crate::db::models::{Conversation, MessagePart, Role};
use crate::db::{
    ContextItemRepository, ConversationRepository, Database, DbRetryConfig, LargeFileRepository,
    MessageRepository, SummaryRepository, context_items, large_files, messages,
    retry_db_operation,
};
use crate::error::{LcmError, Result};
use crate::expansion::{self, DelegatedExpansionContext, DelegationSpec};
use crate::files::LargeFileSidecar;
use crate::provider::{SubAgentGateway, Summarizer};
use crate::retrieval::{
    DescribeResult, ExpandOptions, ExpandResult, GrepHit, GrepRequest, Retrieval,
};
use crate::transcript;

/// A message as delivered by the host. Parts arrive as raw JSON blocks and
/// are narrowed at this boundary.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub role: Role,
    pub content: String,
    pub parts: Vec<serde_json::Value>,
    pub stop_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl IncomingMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            parts: Vec::new(),
            stop_reason: None,
            created_at: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_parts(mut self, parts: Vec<serde_json::Value>) -> Self {
        self.parts = parts;
        self
    }

    pub fn with_stop_reason(mut self, stop_reason: impl Into<String>) -> Self {
        self.stop_reason = Some(stop_reason.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapResult {
    /// True when this call created the conversation.
    pub created: bool,
    /// Transcript messages imported into the store.
    pub imported: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestResult {
    pub message_id: i64,
    pub seq: i64,
}

#[derive(Debug, Clone, Default)]
pub struct IngestBatchResult {
    pub messages: Vec<IngestResult>,
}

pub struct ContextEngine {
    db: Database,
    config: LcmConfig,
    conversations: ConversationRepository,
    messages: MessageRepository,
    items: ContextItemRepository,
    summaries: SummaryRepository,
    large_files: LargeFileRepository,
    assembler: Assembler,
    retrieval: Retrieval,
    compaction: CompactionEngine,
    sidecar: LargeFileSidecar,
    summarizer: Arc<dyn Summarizer>,
    serializer: ConversationSerializer,
}

impl ContextEngine {
    /// Open the configured database (creating it if needed), run migrations,
    /// and initialize the expansion registry.
    pub async fn new(config: LcmConfig, summarizer: Arc<dyn Summarizer>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| LcmError::Input(e.to_string()))?;
        let db = if config.database_path.as_os_str() == ":memory:" {
            Database::connect_in_memory().await?
        } else {
            Database::connect(&config.database_path).await?
        };
        Self::with_database(db, config, summarizer).await
    }

    /// Build the engine over an already-opened database.
    pub async fn with_database(
        db: Database,
        config: LcmConfig,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self> {
        db.run_migrations().await?;
        expansion::init();
        Ok(Self {
            conversations: ConversationRepository::new(db.clone()),
            messages: MessageRepository::new(db.clone()),
            items: ContextItemRepository::new(db.clone()),
            summaries: SummaryRepository::new(db.clone()),
            large_files: LargeFileRepository::new(db.clone()),
            assembler: Assembler::new(db.clone(), config.clone()),
            retrieval: Retrieval::new(db.clone(), config.clone()),
            compaction: CompactionEngine::new(db.clone(), config.clone(), summarizer.clone()),
            sidecar: LargeFileSidecar::new(
                config.large_file_root(),
                config.large_file_token_threshold,
            ),
            summarizer,
            serializer: ConversationSerializer::new(),
            db,
            config,
        })
    }

    pub fn config(&self) -> &LcmConfig {
        &self.config
    }

    pub fn conversations(&self) -> &ConversationRepository {
        &self.conversations
    }

    pub fn messages(&self) -> &MessageRepository {
        &self.messages
    }

    pub fn summaries(&self) -> &SummaryRepository {
        &self.summaries
    }

    pub fn context_items(&self) -> &ContextItemRepository {
        &self.items
    }

    pub fn large_files(&self) -> &LargeFileRepository {
        &self.large_files
    }

    /// Get or create the conversation for a session, reconciling the host's
    /// JSONL transcript when one is supplied. Idempotent.
    pub async fn bootstrap(
        &self,
        session_id: &str,
        transcript_path: Option<&Path>,
    ) -> Result<BootstrapResult> {
        let (conv, created) = self.conversations.get_or_create(session_id).await?;
        let imported = self
            .serializer
            .run(conv.id, || async {
                let imported = match transcript_path {
                    Some(path) => self.import_transcript(&conv, path).await?,
                    None => 0,
                };
                self.conversations.mark_bootstrapped(conv.id).await?;
                Ok::<usize, LcmError>(imported)
            })
            .await?;
        tracing::info!(
            "bootstrapped session {session_id} (created={created}, imported={imported})"
        );
        Ok(BootstrapResult { created, imported })
    }

    async fn import_transcript(&self, conv: &Conversation, path: &Path) -> Result<usize> {
        let transcript = transcript::read_transcript(path)?;
        let stored = self.messages.identities(conv.id).await?;
        let plan = transcript::plan_reconciliation(&transcript, &stored)?;

        let conversation_id = conv.id;
        let count = plan.to_import.len();
        if count > 0 {
            self.db
                .interact(move |conn| {
                    let tx = conn.transaction()?;
                    for msg in &plan.to_import {
                        let row = messages::insert_message_tx(
                            &tx,
                            conversation_id,
                            Some(msg.seq),
                            msg.role,
                            &msg.content,
                            None,
                            msg.created_at,
                        )?;
                        context_items::append_message_tx(&tx, conversation_id, row.id)?;
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await?;
        }
        Ok(count)
    }

    /// Persist one message and append it to the context stream. Large file
    /// parts are extracted to the sidecar before anything is committed.
    pub async fn ingest(&self, session_id: &str, message: IncomingMessage) -> Result<IngestResult> {
        let (conv, _) = self.conversations.get_or_create(session_id).await?;
        self.serializer
            .run(conv.id, || self.ingest_inner(conv.id, message))
            .await
    }

    /// Persist a batch in order, inside one serializer hold.
    pub async fn ingest_batch(
        &self,
        session_id: &str,
        batch: Vec<IncomingMessage>,
    ) -> Result<IngestBatchResult> {
        let (conv, _) = self.conversations.get_or_create(session_id).await?;
        self.serializer
            .run(conv.id, || async {
                let mut result = IngestBatchResult::default();
                for message in batch {
                    result
                        .messages
                        .push(self.ingest_inner(conv.id, message).await?);
                }
                Ok(result)
            })
            .await
    }

    async fn ingest_inner(
        &self,
        conversation_id: i64,
        message: IncomingMessage,
    ) -> Result<IngestResult> {
        let mut parts = message
            .parts
            .into_iter()
            .map(MessagePart::from_value)
            .collect::<Result<Vec<_>>>()?;

        let extracted = self
            .sidecar
            .extract_parts(conversation_id, &mut parts, self.summarizer.as_ref())
            .await?;
        let storage_paths: Vec<String> =
            extracted.iter().map(|f| f.storage_uri.clone()).collect();

        let role = message.role;
        let content = message.content;
        let stop_reason = message.stop_reason;
        let created_at = message.created_at;
        let retry_config = DbRetryConfig::default();
        let committed = retry_db_operation(&retry_config, "ingest", || {
            let content = content.clone();
            let stop_reason = stop_reason.clone();
            let parts = parts.clone();
            let extracted = extracted.clone();
            async move {
                self.db
                    .interact(move |conn| {
                        let tx = conn.transaction()?;
                        let row = messages::insert_message_tx(
                            &tx,
                            conversation_id,
                            None,
                            role,
                            &content,
                            stop_reason.as_deref(),
                            created_at,
                        )?;
                        messages::insert_parts_tx(&tx, row.id, &parts)?;
                        for file in &extracted {
                            large_files::insert_tx(&tx, file)?;
                        }
                        context_items::append_message_tx(&tx, conversation_id, row.id)?;
                        tx.commit()?;
                        Ok(IngestResult {
                            message_id: row.id,
                            seq: row.seq,
                        })
                    })
                    .await
            }
        })
        .await;

        match committed {
            Ok(result) => Ok(result),
            Err(err) => {
                // The sidecar wrote bytes for a message that never landed.
                for path in storage_paths {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::warn!("failed to remove orphaned sidecar file {path}: {e}");
                    }
                }
                Err(err)
            }
        }
    }

    /// Post-turn hook: run the incremental compaction trigger.
    pub async fn after_turn(&self, session_id: &str) -> Result<CompactResult> {
        self.compact(session_id, CompactMode::Incremental).await
    }

    /// Run a compaction variant under the conversation's serializer lane.
    pub async fn compact(&self, session_id: &str, mode: CompactMode) -> Result<CompactResult> {
        if !self.config.enabled {
            return Ok(CompactResult::noop(mode));
        }
        let conv = self.require_conversation(session_id).await?;
        self.serializer
            .run(conv.id, || self.compaction.run(conv.id, mode))
            .await
    }

    /// Materialize the model-visible message array under a token budget.
    pub async fn assemble(&self, session_id: &str, budget_tokens: i64) -> Result<Assembled> {
        let conv = self.require_conversation(session_id).await?;
        self.assembler.assemble(conv.id, budget_tokens).await
    }

    pub async fn grep(&self, request: GrepRequest) -> Result<Vec<GrepHit>> {
        self.retrieval.grep(request).await
    }

    pub async fn describe(&self, id: &str, token_cap: Option<i64>) -> Result<DescribeResult> {
        self.retrieval.describe(id, token_cap).await
    }

    /// Host-side expand with no grant checks.
    pub async fn expand(
        &self,
        summary_id: &str,
        max_depth: Option<usize>,
        token_cap: Option<i64>,
        include_messages: bool,
    ) -> Result<ExpandResult> {
        let options = ExpandOptions {
            max_depth,
            token_cap: token_cap.unwrap_or(self.config.max_expand_tokens),
            include_messages,
        };
        self.retrieval.expand(summary_id, options).await
    }

    /// Expand on behalf of a delegated sub-agent session: the grant bound to
    /// `session_key` must cover the target conversation, and the effective
    /// cap is `min(requested, grant remaining)`; spent tokens are deducted.
    pub async fn expand_scoped(
        &self,
        session_key: &str,
        summary_id: &str,
        max_depth: Option<usize>,
        token_cap: Option<i64>,
        include_messages: bool,
    ) -> Result<ExpandResult> {
        let summary = self
            .summaries
            .get(summary_id)
            .await?
            .ok_or_else(|| LcmError::NotFound(format!("summary {summary_id}")))?;

        let requested = token_cap.unwrap_or(self.config.max_expand_tokens);
        let auth =
            expansion::global().authorize(session_key, summary.conversation_id, requested)?;

        let result = self
            .retrieval
            .expand(
                summary_id,
                ExpandOptions {
                    max_depth,
                    token_cap: auth.effective_cap,
                    include_messages,
                },
            )
            .await?;
        expansion::global().consume(session_key, result.estimated_tokens);
        Ok(result)
    }

    /// Spawn a sub-agent under a scoped grant to answer an expansion task.
    pub async fn expand_via_delegation(
        &self,
        gateway: &dyn SubAgentGateway,
        spec: DelegationSpec,
        ctx: &DelegatedExpansionContext,
    ) -> Result<String> {
        expansion::expand_via_delegation(expansion::global(), gateway, spec, ctx).await
    }

    /// Drop a conversation and everything it owns.
    pub async fn delete_conversation(&self, session_id: &str) -> Result<()> {
        let conv = self.require_conversation(session_id).await?;
        self.serializer
            .run(conv.id, || self.conversations.delete(conv.id))
            .await
    }

    async fn require_conversation(&self, session_id: &str) -> Result<Conversation> {
        self.conversations
            .get_by_session(session_id)
            .await?
            .ok_or_else(|| LcmError::Input(format!("unknown session {session_id:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SummarizeOptions;
    use async_trait::async_trait;

    struct TinySummarizer;

    #[async_trait]
    impl Summarizer for TinySummarizer {
        async fn summarize(
            &self,
            _text: &str,
            _aggressive: bool,
            _opts: &SummarizeOptions,
        ) -> Result<String> {
            Ok("digest".into())
        }
    }

    async fn engine() -> ContextEngine {
        let config = LcmConfig {
            database_path: ":memory:".into(),
            large_file_root: Some(std::env::temp_dir().join("lcm-engine-tests")),
            ..LcmConfig::default()
        };
        ContextEngine::new(config, Arc::new(TinySummarizer))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ingest_assigns_seq_and_appends_stream() {
        let engine = engine().await;
        let a = engine
            .ingest("sess-e1", IncomingMessage::user("hello"))
            .await
            .unwrap();
        let b = engine
            .ingest("sess-e1", IncomingMessage::assistant("hi"))
            .await
            .unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);

        let conv = engine
            .conversations()
            .get_by_session("sess-e1")
            .await
            .unwrap()
            .unwrap();
        let items = engine.context_items().list(conv.id).await.unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_batch_preserves_order() {
        let engine = engine().await;
        let result = engine
            .ingest_batch(
                "sess-e2",
                vec![
                    IncomingMessage::user("one"),
                    IncomingMessage::assistant("two"),
                    IncomingMessage::user("three"),
                ],
            )
            .await
            .unwrap();
        let seqs: Vec<i64> = result.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_ingest_rejects_malformed_parts() {
        let engine = engine().await;
        let err = engine
            .ingest(
                "sess-e3",
                IncomingMessage::user("x").with_parts(vec![serde_json::json!({"no_type": 1})]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LcmError::Input(_)));
    }

    #[tokio::test]
    async fn test_compact_on_unknown_session_is_input_error() {
        let engine = engine().await;
        let err = engine
            .compact("sess-missing", CompactMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, LcmError::Input(_)));
    }

    #[tokio::test]
    async fn test_disabled_engine_skips_compaction() {
        let config = LcmConfig {
            database_path: ":memory:".into(),
            enabled: false,
            ..LcmConfig::default()
        };
        let engine = ContextEngine::new(config, Arc::new(TinySummarizer))
            .await
            .unwrap();
        let result = engine.after_turn("sess-off").await.unwrap();
        assert!(!result.did_work());
    }

    #[tokio::test]
    async fn test_bootstrap_without_transcript_marks_conversation() {
        let engine = engine().await;
        let first = engine.bootstrap("sess-e4", None).await.unwrap();
        assert!(first.created);
        assert_eq!(first.imported, 0);
        let again = engine.bootstrap("sess-e4", None).await.unwrap();
        assert!(!again.created);

        let conv = engine
            .conversations()
            .get_by_session("sess-e4")
            .await
            .unwrap()
            .unwrap();
        assert!(conv.bootstrapped_at.is_some());
    }
}
