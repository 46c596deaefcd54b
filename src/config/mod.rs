//! Configuration Module
//!
//! Resolves engine configuration from the environment over a table of
//! literal defaults. Every knob has an `LCM_*` environment variable.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration.
///
/// The compaction knobs are documented where the compaction engine consumes
/// them; this struct is just the resolved snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcmConfig {
    /// Master switch. When false, `after_turn` and `compact` are no-ops.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// SQLite database location.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Root directory for extracted large-file payloads.
    /// Defaults to a `files/` directory next to the database.
    #[serde(default)]
    pub large_file_root: Option<PathBuf>,

    /// Fraction of the model window at which compaction should kick in.
    #[serde(default = "default_context_threshold")]
    pub context_threshold: f64,

    /// Number of newest raw messages protected from compaction.
    #[serde(default = "default_fresh_tail_count")]
    pub fresh_tail_count: usize,

    /// Minimum contiguous leaves required to condense to depth 1.
    #[serde(default = "default_leaf_min_fanout")]
    pub leaf_min_fanout: usize,

    /// Minimum contiguous summaries required to condense at depth >= 2.
    #[serde(default = "default_condensed_min_fanout")]
    pub condensed_min_fanout: usize,

    /// Forced fanout under budget pressure.
    #[serde(default = "default_condensed_min_fanout_hard")]
    pub condensed_min_fanout_hard: usize,

    /// Max condensation depth during per-turn incremental passes.
    /// 0 disables condensation in incremental mode.
    #[serde(default = "default_incremental_max_depth")]
    pub incremental_max_depth: usize,

    /// Max source tokens collapsed into a single leaf summary.
    #[serde(default = "default_leaf_chunk_tokens")]
    pub leaf_chunk_tokens: i64,

    /// Target output size hint for leaf summaries.
    #[serde(default = "default_leaf_target_tokens")]
    pub leaf_target_tokens: i64,

    /// Target output size hint for condensed summaries.
    #[serde(default = "default_condensed_target_tokens")]
    pub condensed_target_tokens: i64,

    /// Default token cap for `expand` when the caller does not pass one.
    #[serde(default = "default_max_expand_tokens")]
    pub max_expand_tokens: i64,

    /// Inline file payloads at or above this estimated token count are
    /// extracted to the large-file sidecar.
    #[serde(default = "default_large_file_token_threshold")]
    pub large_file_token_threshold: i64,

    /// Max full-sweep rounds for budget-targeted compaction.
    #[serde(default = "default_max_budget_rounds")]
    pub max_budget_rounds: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openclaw")
        .join("lcm.db")
}

fn default_context_threshold() -> f64 {
    0.75
}

fn default_fresh_tail_count() -> usize {
    8
}

fn default_leaf_min_fanout() -> usize {
    8
}

fn default_condensed_min_fanout() -> usize {
    4
}

fn default_condensed_min_fanout_hard() -> usize {
    2
}

fn default_incremental_max_depth() -> usize {
    0
}

fn default_leaf_chunk_tokens() -> i64 {
    20_000
}

fn default_leaf_target_tokens() -> i64 {
    600
}

fn default_condensed_target_tokens() -> i64 {
    900
}

fn default_max_expand_tokens() -> i64 {
    120
}

fn default_large_file_token_threshold() -> i64 {
    25_000
}

fn default_max_budget_rounds() -> usize {
    4
}

impl Default for LcmConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            database_path: default_database_path(),
            large_file_root: None,
            context_threshold: default_context_threshold(),
            fresh_tail_count: default_fresh_tail_count(),
            leaf_min_fanout: default_leaf_min_fanout(),
            condensed_min_fanout: default_condensed_min_fanout(),
            condensed_min_fanout_hard: default_condensed_min_fanout_hard(),
            incremental_max_depth: default_incremental_max_depth(),
            leaf_chunk_tokens: default_leaf_chunk_tokens(),
            leaf_target_tokens: default_leaf_target_tokens(),
            condensed_target_tokens: default_condensed_target_tokens(),
            max_expand_tokens: default_max_expand_tokens(),
            large_file_token_threshold: default_large_file_token_threshold(),
            max_budget_rounds: default_max_budget_rounds(),
        }
    }
}

impl LcmConfig {
    /// Resolve configuration from `LCM_*` environment variables over defaults.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = env_var("LCM_ENABLED") {
            cfg.enabled = parse_bool(&v).context("LCM_ENABLED")?;
        }
        if let Some(v) = env_var("LCM_DATABASE_PATH") {
            cfg.database_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("LCM_LARGE_FILE_ROOT") {
            cfg.large_file_root = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("LCM_CONTEXT_THRESHOLD") {
            cfg.context_threshold = v.parse().context("LCM_CONTEXT_THRESHOLD")?;
        }
        if let Some(v) = env_var("LCM_FRESH_TAIL_COUNT") {
            cfg.fresh_tail_count = v.parse().context("LCM_FRESH_TAIL_COUNT")?;
        }
        if let Some(v) = env_var("LCM_LEAF_MIN_FANOUT") {
            cfg.leaf_min_fanout = v.parse().context("LCM_LEAF_MIN_FANOUT")?;
        }
        if let Some(v) = env_var("LCM_CONDENSED_MIN_FANOUT") {
            cfg.condensed_min_fanout = v.parse().context("LCM_CONDENSED_MIN_FANOUT")?;
        }
        if let Some(v) = env_var("LCM_CONDENSED_MIN_FANOUT_HARD") {
            cfg.condensed_min_fanout_hard = v.parse().context("LCM_CONDENSED_MIN_FANOUT_HARD")?;
        }
        if let Some(v) = env_var("LCM_INCREMENTAL_MAX_DEPTH") {
            cfg.incremental_max_depth = v.parse().context("LCM_INCREMENTAL_MAX_DEPTH")?;
        }
        if let Some(v) = env_var("LCM_LEAF_CHUNK_TOKENS") {
            cfg.leaf_chunk_tokens = v.parse().context("LCM_LEAF_CHUNK_TOKENS")?;
        }
        if let Some(v) = env_var("LCM_LEAF_TARGET_TOKENS") {
            cfg.leaf_target_tokens = v.parse().context("LCM_LEAF_TARGET_TOKENS")?;
        }
        if let Some(v) = env_var("LCM_CONDENSED_TARGET_TOKENS") {
            cfg.condensed_target_tokens = v.parse().context("LCM_CONDENSED_TARGET_TOKENS")?;
        }
        if let Some(v) = env_var("LCM_MAX_EXPAND_TOKENS") {
            cfg.max_expand_tokens = v.parse().context("LCM_MAX_EXPAND_TOKENS")?;
        }
        if let Some(v) = env_var("LCM_LARGE_FILE_TOKEN_THRESHOLD") {
            cfg.large_file_token_threshold =
                v.parse().context("LCM_LARGE_FILE_TOKEN_THRESHOLD")?;
        }
        if let Some(v) = env_var("LCM_MAX_BUDGET_ROUNDS") {
            cfg.max_budget_rounds = v.parse().context("LCM_MAX_BUDGET_ROUNDS")?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate knob ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.context_threshold > 0.0 && self.context_threshold < 1.0) {
            bail!(
                "context_threshold must be in (0, 1), got {}",
                self.context_threshold
            );
        }
        if self.leaf_chunk_tokens <= 0 {
            bail!("leaf_chunk_tokens must be positive");
        }
        if self.leaf_min_fanout == 0 || self.condensed_min_fanout == 0 {
            bail!("fanout minimums must be at least 1");
        }
        if self.condensed_min_fanout_hard == 0 {
            bail!("condensed_min_fanout_hard must be at least 1");
        }
        if self.condensed_min_fanout_hard > self.condensed_min_fanout {
            bail!("condensed_min_fanout_hard cannot exceed condensed_min_fanout");
        }
        if self.max_budget_rounds == 0 {
            bail!("max_budget_rounds must be at least 1");
        }
        Ok(())
    }

    /// Effective large-file root: the configured directory, or `files/`
    /// beside the database.
    pub fn large_file_root(&self) -> PathBuf {
        self.large_file_root.clone().unwrap_or_else(|| {
            self.database_path
                .parent()
                .map(|p| p.join("files"))
                .unwrap_or_else(|| PathBuf::from("files"))
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got {other:?}"),
    }
}
