//! Delegated expansion orchestration.
//!
//! The issuer spawns a one-shot sub-agent that may call `expand` under a
//! scoped grant, waits for it, and reads its reply. Grant revocation and
//! session deletion bracket the gateway calls on every exit path, including
//! cancellation (the grant side is a drop guard). Delegation is one level
//! deep: a delegated session asking to delegate again is refused.

use serde_json::json;

use super::{BlockReason, ExpansionRegistry, IssueGrant};
use crate::error::{LcmError, Result};
use crate::provider::{GatewayMethod, SubAgentGateway, read_latest_assistant_reply};

/// Recovery guidance returned with every recursion block.
pub const RECURSION_GUIDANCE: &str =
    "Delegated sessions cannot spawn further delegated expansions. Call expand \
     directly with your existing grant and synthesize the answer yourself.";

/// How long cleanup gateway calls may take.
const CLEANUP_TIMEOUT_MS: u64 = 5_000;

/// Stamped onto every delegated session so the engine can recognize
/// second-level delegation attempts.
#[derive(Debug, Clone)]
pub struct DelegatedExpansionContext {
    /// Caller-chosen id; repeated blocked attempts with the same id report
    /// `idempotent_reentry`.
    pub request_id: String,
    /// 0 for the origin session; >= 1 inside a delegated session.
    pub expansion_depth: u32,
    pub origin_session_key: String,
}

impl DelegatedExpansionContext {
    pub fn origin(origin_session_key: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            expansion_depth: 0,
            origin_session_key: origin_session_key.into(),
        }
    }

    /// The context a spawned sub-agent session carries.
    pub fn delegated(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            expansion_depth: self.expansion_depth + 1,
            origin_session_key: self.origin_session_key.clone(),
        }
    }
}

/// Everything needed to run one delegated expansion.
#[derive(Debug, Clone)]
pub struct DelegationSpec {
    pub issuer_session_id: String,
    /// Session key the sub-agent will run under.
    pub delegated_session_key: String,
    pub allowed_conversation_ids: Vec<i64>,
    pub token_cap: i64,
    pub ttl_ms: u64,
    /// Task prompt handed to the sub-agent.
    pub prompt: String,
    pub timeout_ms: u64,
}

/// Revokes the grant if the orchestration future is dropped before the
/// explicit cleanup runs.
struct GrantGuard<'a> {
    registry: &'a ExpansionRegistry,
    session_key: String,
    armed: bool,
}

impl Drop for GrantGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.revoke(&self.session_key);
        }
    }
}

/// Spawn a sub-agent under a scoped grant, wait for it, return its reply.
pub async fn expand_via_delegation(
    registry: &'static ExpansionRegistry,
    gateway: &dyn SubAgentGateway,
    spec: DelegationSpec,
    ctx: &DelegatedExpansionContext,
) -> Result<String> {
    registry.telemetry().record_start();

    if ctx.expansion_depth >= 1 {
        let reason: BlockReason = registry.note_delegation_block(&ctx.request_id);
        registry.telemetry().record_block();
        tracing::warn!(
            "blocked recursive delegated expansion (request {}, reason {reason})",
            ctx.request_id
        );
        return Err(LcmError::RecursionBlocked {
            reason,
            guidance: RECURSION_GUIDANCE.to_string(),
        });
    }

    registry.issue_grant(IssueGrant {
        delegated_session_key: spec.delegated_session_key.clone(),
        issuer_session_id: spec.issuer_session_id.clone(),
        allowed_conversation_ids: spec.allowed_conversation_ids.clone(),
        token_cap: spec.token_cap,
        ttl_ms: spec.ttl_ms,
    })?;
    let mut guard = GrantGuard {
        registry,
        session_key: spec.delegated_session_key.clone(),
        armed: true,
    };

    let outcome = run_delegation(gateway, &spec).await;

    // Explicit cleanup path: revoke the grant, delete the session.
    guard.armed = false;
    registry.revoke(&spec.delegated_session_key);
    if let Err(e) = gateway
        .call(
            GatewayMethod::SessionsDelete,
            json!({ "session_key": spec.delegated_session_key }),
            CLEANUP_TIMEOUT_MS,
        )
        .await
    {
        tracing::warn!(
            "failed to delete delegated session {}: {e}",
            spec.delegated_session_key
        );
    }

    match outcome {
        Ok(reply) => {
            registry.telemetry().record_success();
            Ok(reply)
        }
        Err(err) => {
            if matches!(err, LcmError::GatewayTimeout { .. }) {
                registry.telemetry().record_timeout();
            }
            Err(err)
        }
    }
}

async fn run_delegation(gateway: &dyn SubAgentGateway, spec: &DelegationSpec) -> Result<String> {
    gateway
        .call(
            GatewayMethod::Agent,
            json!({
                "session_key": spec.delegated_session_key,
                "prompt": spec.prompt,
            }),
            spec.timeout_ms,
        )
        .await?;

    gateway
        .call(
            GatewayMethod::AgentWait,
            json!({ "session_key": spec.delegated_session_key }),
            spec.timeout_ms,
        )
        .await?;

    let session = gateway
        .call(
            GatewayMethod::SessionsGet,
            json!({ "session_key": spec.delegated_session_key }),
            spec.timeout_ms,
        )
        .await?;

    read_latest_assistant_reply(&session)
}
