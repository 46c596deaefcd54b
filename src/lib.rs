//! OpenClaw LCM - Lossless Context Management for Long-Running Agents
//!
//! A persistent, incrementally maintained summarization engine that keeps a
//! conversational agent's context window under budget without permanently
//! discarding information. The host feeds it the message stream; the engine
//! returns a bounded message sequence for each model call and keeps a
//! content-addressed, queryable record of everything compacted away.
//!
//! ## Features
//!
//! - **Summary DAG:** leaf summaries over raw messages, condensed summaries
//!   over summaries, with lineage, time-range and token metadata
//! - **Incremental compaction:** per-turn leaf passes, full sweeps, and
//!   budget-targeted rounds with guaranteed monotone progress
//! - **Budgeted assembly:** fresh-tail protection plus tool-call/tool-result
//!   pairing repair for downstream model APIs
//! - **Retrieval:** regex and FTS5 search, single-node description with a
//!   subtree manifest, bounded DAG expansion
//! - **Delegated expansion:** scoped, token-capped sub-agent grants with a
//!   one-level recursion guard
//! - **Local-first:** one embedded SQLite file, WAL mode, forward-compatible
//!   migrations
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use openclaw_lcm::{ContextEngine, IncomingMessage, LcmConfig};
//! # use openclaw_lcm::provider::{Summarizer, SummarizeOptions};
//! # struct MySummarizer;
//! # #[async_trait::async_trait]
//! # impl Summarizer for MySummarizer {
//! #     async fn summarize(&self, text: &str, _aggressive: bool, _opts: &SummarizeOptions)
//! #         -> openclaw_lcm::Result<String> { Ok(text.chars().take(64).collect()) }
//! # }
//!
//! # async fn demo() -> openclaw_lcm::Result<()> {
//! let engine = ContextEngine::new(LcmConfig::from_env().unwrap(), Arc::new(MySummarizer)).await?;
//! engine.bootstrap("session-1", None).await?;
//! engine.ingest("session-1", IncomingMessage::user("hello")).await?;
//! engine.after_turn("session-1").await?;
//! let context = engine.assemble("session-1", 100_000).await?;
//! # let _ = context;
//! # Ok(())
//! # }
//! ```

pub mod assemble;
pub mod compaction;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod expansion;
pub mod files;
pub mod provider;
pub mod retrieval;
pub mod tokenizer;
pub mod transcript;

// Re-export the host-facing surface.
pub use assemble::{Assembled, AssembledTurn, ContentBlock};
pub use compaction::{CompactMode, CompactResult, FALLBACK_MARKER};
pub use config::LcmConfig;
pub use db::models::{
    Conversation, LargeFile, Message, MessagePart, Role, Summary, SummaryKind,
};
pub use engine::{
    BootstrapResult, ContextEngine, IncomingMessage, IngestBatchResult, IngestResult,
};
pub use error::{ErrorCode, LcmError, Result};
pub use retrieval::{
    DescribeResult, ExpandOptions, ExpandResult, GrepHit, GrepMode, GrepRequest, GrepTarget,
    RetrievalScope,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
