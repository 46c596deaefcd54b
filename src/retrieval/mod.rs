//! Retrieval
//!
//! Read-only queries over everything the engine has ever stored: `grep`
//! across messages and summaries, `describe` for a single node with its
//! subtree manifest, and bounded `expand` of a summary DAG subtree.

mod describe;
mod expand;
mod grep;

pub use describe::{BudgetFit, DescribeResult, ExpandCosts, SubtreeNode, SummaryDescription};
pub use expand::{ExpandOptions, ExpandResult, ExpandedMessage, ExpandedNode};
pub use grep::{GrepHit, GrepMode, GrepRequest, GrepTarget, HitKind};

use chrono::{DateTime, Utc};

use crate::config::LcmConfig;
use crate::db::Database;
use crate::error::Result;

/// Conversation and time bounds shared by all retrieval operations.
/// `conversation_ids: None` means all conversations.
#[derive(Debug, Clone, Default)]
pub struct RetrievalScope {
    pub conversation_ids: Option<Vec<i64>>,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

impl RetrievalScope {
    pub fn conversation(id: i64) -> Self {
        Self {
            conversation_ids: Some(vec![id]),
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self::default()
    }
}

pub struct Retrieval {
    db: Database,
    config: LcmConfig,
}

impl Retrieval {
    pub fn new(db: Database, config: LcmConfig) -> Self {
        Self { db, config }
    }

    /// Regex or full-text search over messages and/or summaries.
    pub async fn grep(&self, request: GrepRequest) -> Result<Vec<GrepHit>> {
        grep::run(&self.db, request).await
    }

    /// Describe one `sum_` or `file_` id. `token_cap` feeds the manifest's
    /// budget-fit flags; `None` uses the configured expand default.
    pub async fn describe(&self, id: &str, token_cap: Option<i64>) -> Result<DescribeResult> {
        let cap = token_cap.unwrap_or(self.config.max_expand_tokens);
        describe::run(&self.db, id, cap).await
    }

    /// Token-capped DFS expansion of a summary subtree.
    pub async fn expand(&self, summary_id: &str, options: ExpandOptions) -> Result<ExpandResult> {
        expand::run(&self.db, summary_id, options).await
    }
}
