//! Summarization escalation ladder.
//!
//! Every summarization attempt runs the same progression: normal call, then
//! an aggressive retry, then a deterministic truncation of the input. The
//! ladder guarantees a usable summary without ever throwing on degenerate
//! model output; only a real summarizer error aborts the pass.

use crate::error::Result;
use crate::provider::{SummarizeOptions, Summarizer};
use crate::tokenizer::{estimate_tokens, truncate_chars};

/// Marker appended to deterministic truncation fallbacks.
pub const FALLBACK_MARKER: &str = "[LCM fallback summary; truncated for context management]";

/// Output size hint for a normal leaf pass.
pub(crate) fn leaf_target(input_tokens: i64) -> i64 {
    ((input_tokens as f64 * 0.35) as i64).clamp(192, 1200)
}

/// Output size hint for an aggressive leaf retry.
pub(crate) fn aggressive_leaf_target(input_tokens: i64) -> i64 {
    ((input_tokens as f64 * 0.2) as i64).clamp(96, 640)
}

/// Output size hint for condensation at any depth.
pub(crate) fn condensed_target(configured: i64) -> i64 {
    configured.max(512)
}

/// What the ladder produced.
#[derive(Debug, Clone)]
pub(crate) struct EscalationOutcome {
    pub content: String,
    /// True when the content is a deterministic truncation, not model output.
    pub fallback: bool,
}

/// Degenerate output: empty, or at least as large as what it summarizes.
fn is_degenerate(output: &str, input_tokens: i64) -> bool {
    output.trim().is_empty() || estimate_tokens(output) >= input_tokens
}

/// Deterministic last resort: truncate the input and mark it.
pub(crate) fn fallback_summary(input: &str, target_tokens: i64) -> String {
    let budget_chars = (4 * target_tokens).max(256) as usize;
    let truncated = truncate_chars(input, budget_chars);
    format!("{truncated}\n\n{FALLBACK_MARKER}")
}

/// Run the three-level escalation for one pass.
///
/// `normal_target` doubles as the sizing base for the fallback truncation.
/// Summarizer errors propagate and abort the pass; degenerate output does not.
pub(crate) async fn summarize_with_escalation(
    summarizer: &dyn Summarizer,
    input: &str,
    previous_summary: String,
    is_condensed: bool,
    depth: Option<i64>,
    normal_target: i64,
    aggressive_target: i64,
) -> Result<EscalationOutcome> {
    let input_tokens = estimate_tokens(input);

    let opts = SummarizeOptions {
        previous_summary: previous_summary.clone(),
        is_condensed,
        depth,
        target_tokens: normal_target,
    };
    let first = summarizer.summarize(input, false, &opts).await?;
    if !is_degenerate(&first, input_tokens) {
        return Ok(EscalationOutcome {
            content: first,
            fallback: false,
        });
    }

    tracing::debug!("summarizer output degenerate; retrying aggressive");
    let opts = SummarizeOptions {
        previous_summary,
        is_condensed,
        depth,
        target_tokens: aggressive_target,
    };
    let second = summarizer.summarize(input, true, &opts).await?;
    if !is_degenerate(&second, input_tokens) {
        return Ok(EscalationOutcome {
            content: second,
            fallback: false,
        });
    }

    tracing::warn!("summarizer degenerate twice; committing deterministic truncation");
    Ok(EscalationOutcome {
        content: fallback_summary(input, normal_target),
        fallback: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted summarizer: pops one canned response per call.
    pub(crate) struct ScriptedSummarizer {
        script: Mutex<Vec<Result<String>>>,
        pub calls: Mutex<Vec<bool>>,
    }

    impl ScriptedSummarizer {
        pub fn new(script: Vec<Result<String>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Summarizer for ScriptedSummarizer {
        async fn summarize(
            &self,
            _text: &str,
            aggressive: bool,
            _opts: &SummarizeOptions,
        ) -> Result<String> {
            self.calls.lock().unwrap().push(aggressive);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(String::new())
            } else {
                script.remove(0)
            }
        }
    }

    #[test]
    fn test_target_sizing() {
        assert_eq!(leaf_target(100), 192); // clamped low
        assert_eq!(leaf_target(10_000), 1200); // clamped high
        assert_eq!(leaf_target(2_000), 700);
        assert_eq!(aggressive_leaf_target(100), 96);
        assert_eq!(aggressive_leaf_target(2_000), 400);
        assert_eq!(aggressive_leaf_target(100_000), 640);
        assert_eq!(condensed_target(900), 900);
        assert_eq!(condensed_target(100), 512);
    }

    #[test]
    fn test_fallback_summary_carries_marker() {
        let input = "x".repeat(10_000);
        let fb = fallback_summary(&input, 100);
        assert!(fb.ends_with(FALLBACK_MARKER));
        // 4 * 100 < 256 floor
        assert!(fb.len() < 256 + FALLBACK_MARKER.len() + 10);
        assert!(fb.starts_with("xxx"));
    }

    #[tokio::test]
    async fn test_good_first_attempt_short_circuits() {
        let s = ScriptedSummarizer::new(vec![Ok("a tight summary".into())]);
        let input = "long input ".repeat(50);
        let out = summarize_with_escalation(&s, &input, String::new(), false, None, 200, 100)
            .await
            .unwrap();
        assert!(!out.fallback);
        assert_eq!(out.content, "a tight summary");
        assert_eq!(*s.calls.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_empty_then_aggressive_succeeds() {
        let s = ScriptedSummarizer::new(vec![Ok("".into()), Ok("terse".into())]);
        let input = "long input ".repeat(50);
        let out = summarize_with_escalation(&s, &input, String::new(), false, None, 200, 100)
            .await
            .unwrap();
        assert!(!out.fallback);
        assert_eq!(out.content, "terse");
        assert_eq!(*s.calls.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_non_shrinking_twice_falls_back() {
        let echo = "echo ".repeat(300); // larger than the input
        let s = ScriptedSummarizer::new(vec![Ok("".into()), Ok(echo)]);
        let input = "long input ".repeat(20);
        let out = summarize_with_escalation(&s, &input, String::new(), false, None, 200, 100)
            .await
            .unwrap();
        assert!(out.fallback);
        assert!(out.content.contains(FALLBACK_MARKER));
        assert!(out.content.starts_with("long input"));
    }

    #[tokio::test]
    async fn test_summarizer_error_aborts() {
        let s = ScriptedSummarizer::new(vec![Err(crate::error::LcmError::External(
            "model unavailable".into(),
        ))]);
        let err = summarize_with_escalation(&s, "input text", String::new(), false, None, 200, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::LcmError::External(_)));
    }
}
