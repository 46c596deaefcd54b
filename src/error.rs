//! Error types for the LCM core.
//!
//! Every fallible public operation returns [`LcmError`]. Each variant maps to
//! a stable machine-readable [`ErrorCode`] so hosts can branch on failures
//! without parsing display strings.

use crate::expansion::BlockReason;

pub type Result<T> = std::result::Result<T, LcmError>;

/// Stable machine-readable error codes surfaced alongside [`LcmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    InvariantViolation,
    DuplicateSeq,
    ReconciliationRequired,
    NotFound,
    GrantNotFound,
    GrantExpired,
    GrantRevoked,
    ConversationOutOfScope,
    ExpansionBudgetExhausted,
    ExpansionRecursionBlocked,
    ExternalService,
    GatewayTimeout,
    Database,
    Storage,
    Serialization,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::InvariantViolation => "INVARIANT_VIOLATION",
            ErrorCode::DuplicateSeq => "DUPLICATE_SEQ",
            ErrorCode::ReconciliationRequired => "RECONCILIATION_REQUIRED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::GrantNotFound => "GRANT_NOT_FOUND",
            ErrorCode::GrantExpired => "GRANT_EXPIRED",
            ErrorCode::GrantRevoked => "GRANT_REVOKED",
            ErrorCode::ConversationOutOfScope => "CONVERSATION_OUT_OF_SCOPE",
            ErrorCode::ExpansionBudgetExhausted => "EXPANSION_BUDGET_EXHAUSTED",
            ErrorCode::ExpansionRecursionBlocked => "EXPANSION_RECURSION_BLOCKED",
            ErrorCode::ExternalService => "EXTERNAL_SERVICE",
            ErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
            ErrorCode::Database => "DATABASE",
            ErrorCode::Storage => "STORAGE",
            ErrorCode::Serialization => "SERIALIZATION",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the context engine.
#[derive(Debug, thiserror::Error)]
pub enum LcmError {
    /// Bad caller input: unknown session, invalid pattern, empty required
    /// params. Never retried.
    #[error("invalid input: {0}")]
    Input(String),

    /// A structural invariant would be violated (cyclic edge, invalid
    /// kind/depth pair, cross-conversation reference). Aborts the enclosing
    /// transaction.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// `UNIQUE(conversation_id, seq)` violation — signals a concurrent writer
    /// on a single-writer store.
    #[error("duplicate message seq {seq} in conversation {conversation_id}")]
    DuplicateSeq { conversation_id: i64, seq: i64 },

    /// Bootstrap found a store and transcript with no common anchor; refusing
    /// to truncate either side.
    #[error("transcript reconciliation required: {0}")]
    Reconciliation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Grant lookup failures and scope refusals from the expansion registry.
    #[error("expansion denied ({code}): {message}")]
    Authorization { code: ErrorCode, message: String },

    /// A delegated session attempted a second-level expansion.
    #[error("EXPANSION_RECURSION_BLOCKED ({reason}): {guidance}")]
    RecursionBlocked {
        reason: BlockReason,
        guidance: String,
    },

    /// External collaborator (summarizer, gateway) failed.
    #[error("external service error: {0}")]
    External(String),

    /// Gateway call exceeded its timeout.
    #[error("gateway timeout after {timeout_ms}ms: {method}")]
    GatewayTimeout { method: String, timeout_ms: u64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LcmError {
    /// Classify this error with a stable code.
    pub fn code(&self) -> ErrorCode {
        match self {
            LcmError::Input(_) => ErrorCode::InvalidInput,
            LcmError::Invariant(_) => ErrorCode::InvariantViolation,
            LcmError::DuplicateSeq { .. } => ErrorCode::DuplicateSeq,
            LcmError::Reconciliation(_) => ErrorCode::ReconciliationRequired,
            LcmError::NotFound(_) => ErrorCode::NotFound,
            LcmError::Authorization { code, .. } => *code,
            LcmError::RecursionBlocked { .. } => ErrorCode::ExpansionRecursionBlocked,
            LcmError::External(_) => ErrorCode::ExternalService,
            LcmError::GatewayTimeout { .. } => ErrorCode::GatewayTimeout,
            LcmError::Database(_) => ErrorCode::Database,
            LcmError::Storage(_) => ErrorCode::Storage,
            LcmError::Serialization(_) => ErrorCode::Serialization,
        }
    }

    /// True when retrying the identical call can never succeed.
    pub fn is_deterministic_refusal(&self) -> bool {
        matches!(
            self,
            LcmError::Input(_)
                | LcmError::Invariant(_)
                | LcmError::Authorization { .. }
                | LcmError::RecursionBlocked { .. }
        )
    }
}

impl From<rusqlite::Error> for LcmError {
    fn from(e: rusqlite::Error) -> Self {
        LcmError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            ErrorCode::ExpansionRecursionBlocked.as_str(),
            "EXPANSION_RECURSION_BLOCKED"
        );
        assert_eq!(ErrorCode::DuplicateSeq.as_str(), "DUPLICATE_SEQ");
    }

    #[test]
    fn test_duplicate_seq_classification() {
        let err = LcmError::DuplicateSeq {
            conversation_id: 1,
            seq: 42,
        };
        assert_eq!(err.code(), ErrorCode::DuplicateSeq);
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_authorization_is_deterministic() {
        let err = LcmError::Authorization {
            code: ErrorCode::GrantExpired,
            message: "ttl elapsed".into(),
        };
        assert!(err.is_deterministic_refusal());
        assert_eq!(err.code(), ErrorCode::GrantExpired);
    }
}
