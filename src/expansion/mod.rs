//! Expansion Authorization
//!
//! Process-wide registry of scoped grants that let sub-agent sessions call
//! `expand`, plus the recursion guard that keeps delegation one level deep
//! and the monotonic telemetry counters.
//!
//! The registry is a lifecycle-scoped singleton: `init` on engine startup,
//! `reset_for_tests` between tests. It is guarded by a single lock held only
//! for O(1) map operations and never across an await.

mod delegate;
mod grants;
pub mod session_key;

pub use delegate::{
    DelegatedExpansionContext, DelegationSpec, RECURSION_GUIDANCE, expand_via_delegation,
};
pub use grants::{AuthorizedExpand, Grant, IssueGrant};

use once_cell::sync::OnceCell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use grants::RegistryState;

/// Why a delegated expansion was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// First refusal for this request: the session is already delegated.
    DepthCap,
    /// The same `request_id` was blocked before.
    IdempotentReentry,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BlockReason::DepthCap => "depth_cap",
            BlockReason::IdempotentReentry => "idempotent_reentry",
        })
    }
}

/// Monotonic process-wide counters for delegated expansion.
#[derive(Default)]
pub struct ExpansionTelemetry {
    start: AtomicU64,
    block: AtomicU64,
    timeout: AtomicU64,
    success: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub start: u64,
    pub block: u64,
    pub timeout: u64,
    pub success: u64,
}

impl ExpansionTelemetry {
    pub(crate) fn record_start(&self) {
        self.start.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_block(&self) {
        self.block.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_timeout(&self) {
        self.timeout.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            start: self.start.load(Ordering::Relaxed),
            block: self.block.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.start.store(0, Ordering::Relaxed);
        self.block.store(0, Ordering::Relaxed);
        self.timeout.store(0, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
    }
}

/// The process-wide grant registry.
pub struct ExpansionRegistry {
    pub(crate) state: Mutex<RegistryState>,
    telemetry: ExpansionTelemetry,
}

impl ExpansionRegistry {
    fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            telemetry: ExpansionTelemetry::default(),
        }
    }

    /// A private registry instance for unit tests that must not share the
    /// process-wide singleton.
    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Self {
        Self::new()
    }

    pub fn telemetry(&self) -> &ExpansionTelemetry {
        &self.telemetry
    }
}

static REGISTRY: OnceCell<ExpansionRegistry> = OnceCell::new();

/// Initialize (or fetch) the singleton. Called from engine construction so
/// no static construction races with tests.
pub fn init() -> &'static ExpansionRegistry {
    REGISTRY.get_or_init(ExpansionRegistry::new)
}

/// The live registry. Initializes on first use.
pub fn global() -> &'static ExpansionRegistry {
    init()
}

/// Clear all grants, blocked request ids and counters.
pub fn reset_for_tests() {
    let registry = init();
    registry
        .state
        .lock()
        .expect("expansion registry lock poisoned")
        .clear();
    registry.telemetry.reset();
}
