//! Database Layer
//!
//! Connection management, schema migration, models, and the per-table
//! repositories. The embedded SQLite file is the single source of truth;
//! every mutation is wrapped in a transaction.

pub(crate) mod context_items;
pub(crate) mod conversations;
mod database;
pub(crate) mod large_files;
pub(crate) mod messages;
pub mod models;
pub mod retry;
pub(crate) mod summaries;

pub use context_items::ContextItemRepository;
pub use conversations::ConversationRepository;
pub use database::Database;
pub use large_files::LargeFileRepository;
pub use messages::MessageRepository;
pub use models::*;
pub use retry::{DbRetryConfig, retry_db_operation};
pub use summaries::{NewSummary, SummaryRepository, SummarySources, SubtreeEntry};
