//! Grant storage and lifecycle.
//!
//! Lifecycle: issued → active → {revoked, expired}. Expiry is checked lazily
//! on access; revocation tombstones the binding so refusals stay
//! distinguishable until an operator sweep removes the rows.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::{BlockReason, ExpansionRegistry};
use crate::error::{ErrorCode, LcmError, Result};

/// A scoped authorization for one delegated session.
#[derive(Debug, Clone)]
pub struct Grant {
    pub id: Uuid,
    pub delegated_session_key: String,
    pub issuer_session_id: String,
    pub allowed_conversation_ids: HashSet<i64>,
    /// Remaining token budget; decremented on use.
    pub token_cap: i64,
    pub ttl_ms: u64,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

impl Grant {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::milliseconds(self.ttl_ms as i64)
    }
}

/// Parameters for issuing a grant.
#[derive(Debug, Clone)]
pub struct IssueGrant {
    pub delegated_session_key: String,
    pub issuer_session_id: String,
    pub allowed_conversation_ids: Vec<i64>,
    pub token_cap: i64,
    pub ttl_ms: u64,
}

/// A successful authorization: which grant, and how much budget this call
/// may spend.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizedExpand {
    pub grant_id: Uuid,
    pub effective_cap: i64,
}

#[derive(Default)]
pub(crate) struct RegistryState {
    grants: HashMap<String, Grant>,
    blocked_requests: HashSet<String>,
}

impl RegistryState {
    pub(crate) fn clear(&mut self) {
        self.grants.clear();
        self.blocked_requests.clear();
    }
}

impl ExpansionRegistry {
    /// Issue a grant bound to a delegated session key, replacing any prior
    /// binding for that key.
    pub fn issue_grant(&self, params: IssueGrant) -> Result<Grant> {
        if params.token_cap <= 0 {
            return Err(LcmError::Input("grant token_cap must be positive".into()));
        }
        if params.delegated_session_key.trim().is_empty() {
            return Err(LcmError::Input("delegated_session_key must not be empty".into()));
        }
        let grant = Grant {
            id: Uuid::new_v4(),
            delegated_session_key: params.delegated_session_key.clone(),
            issuer_session_id: params.issuer_session_id,
            allowed_conversation_ids: params.allowed_conversation_ids.into_iter().collect(),
            token_cap: params.token_cap,
            ttl_ms: params.ttl_ms,
            created_at: Utc::now(),
            revoked: false,
        };
        let mut state = self.state.lock().expect("expansion registry lock poisoned");
        state
            .grants
            .insert(params.delegated_session_key, grant.clone());
        tracing::debug!(
            "issued expansion grant {} for session {} ({} tokens, {}ms ttl)",
            grant.id,
            grant.delegated_session_key,
            grant.token_cap,
            grant.ttl_ms
        );
        Ok(grant)
    }

    /// Authorize one `expand` call from a delegated session. The effective
    /// cap is `min(requested, remaining)`.
    pub fn authorize(
        &self,
        session_key: &str,
        conversation_id: i64,
        requested_cap: i64,
    ) -> Result<AuthorizedExpand> {
        let mut state = self.state.lock().expect("expansion registry lock poisoned");
        let Some(grant) = state.grants.get_mut(session_key) else {
            return Err(refusal(
                ErrorCode::GrantNotFound,
                format!("no expansion grant bound to session {session_key}"),
            ));
        };
        if grant.revoked {
            return Err(refusal(
                ErrorCode::GrantRevoked,
                format!("expansion grant for session {session_key} was revoked"),
            ));
        }
        if grant.expired_at(Utc::now()) {
            // Lazy expiry: tombstone in place.
            grant.revoked = true;
            return Err(refusal(
                ErrorCode::GrantExpired,
                format!(
                    "expansion grant for session {session_key} expired after {}ms",
                    grant.ttl_ms
                ),
            ));
        }
        if !grant.allowed_conversation_ids.contains(&conversation_id) {
            return Err(refusal(
                ErrorCode::ConversationOutOfScope,
                format!("conversation {conversation_id} is outside the grant's scope"),
            ));
        }
        if grant.token_cap <= 0 {
            return Err(refusal(
                ErrorCode::ExpansionBudgetExhausted,
                "the grant's token budget is exhausted".into(),
            ));
        }
        Ok(AuthorizedExpand {
            grant_id: grant.id,
            effective_cap: requested_cap.max(0).min(grant.token_cap),
        })
    }

    /// Deduct spent tokens from the session's grant.
    pub fn consume(&self, session_key: &str, used_tokens: i64) {
        let mut state = self.state.lock().expect("expansion registry lock poisoned");
        if let Some(grant) = state.grants.get_mut(session_key) {
            grant.token_cap = (grant.token_cap - used_tokens.max(0)).max(0);
        }
    }

    /// Revoke the binding for a session. Idempotent; returns whether a live
    /// grant was revoked.
    pub fn revoke(&self, session_key: &str) -> bool {
        let mut state = self.state.lock().expect("expansion registry lock poisoned");
        match state.grants.get_mut(session_key) {
            Some(grant) if !grant.revoked => {
                grant.revoked = true;
                tracing::debug!("revoked expansion grant for session {session_key}");
                true
            }
            _ => false,
        }
    }

    /// Operator sweep: drop revoked and expired rows. Returns how many were
    /// removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().expect("expansion registry lock poisoned");
        let before = state.grants.len();
        state
            .grants
            .retain(|_, g| !g.revoked && !g.expired_at(now));
        before - state.grants.len()
    }

    /// Current grant for a session, if any.
    pub fn grant_for(&self, session_key: &str) -> Option<Grant> {
        let state = self.state.lock().expect("expansion registry lock poisoned");
        state.grants.get(session_key).cloned()
    }

    /// Record a recursion block for `request_id` and classify it.
    pub(crate) fn note_delegation_block(&self, request_id: &str) -> BlockReason {
        let mut state = self.state.lock().expect("expansion registry lock poisoned");
        if state.blocked_requests.insert(request_id.to_string()) {
            BlockReason::DepthCap
        } else {
            BlockReason::IdempotentReentry
        }
    }
}

fn refusal(code: ErrorCode, message: String) -> LcmError {
    LcmError::Authorization { code, message }
}
