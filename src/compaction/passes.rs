//! Run selection over the context item stream.
//!
//! Pure functions from a sequenced item snapshot to the contiguous run a pass
//! should collapse. The fresh tail is counted in *message* items: summary
//! items interleaved near the end do not eat into the protection.

use crate::db::models::SequencedItem;

/// A contiguous run of items selected for replacement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Run {
    pub start_ordinal: i64,
    pub end_ordinal: i64,
    pub token_sum: i64,
    /// Source message ids (leaf runs only).
    pub message_ids: Vec<i64>,
    /// Member summary ids (condensation runs only).
    pub summary_ids: Vec<String>,
}

/// Index of the first protected item: everything before it is evictable.
///
/// Walks from the end counting message items until `fresh_tail_count` are
/// found; with fewer messages than that, nothing is evictable.
pub(crate) fn evictable_prefix_len(items: &[SequencedItem], fresh_tail_count: usize) -> usize {
    if fresh_tail_count == 0 {
        return items.len();
    }
    let mut seen = 0usize;
    for (idx, item) in items.iter().enumerate().rev() {
        if item.is_message() {
            seen += 1;
            if seen == fresh_tail_count {
                return idx;
            }
        }
    }
    0
}

/// Total tokens of raw message items in the evictable prefix — the incremental
/// trigger quantity.
pub(crate) fn raw_tokens_outside_tail(items: &[SequencedItem], fresh_tail_count: usize) -> i64 {
    let cut = evictable_prefix_len(items, fresh_tail_count);
    items[..cut]
        .iter()
        .filter(|i| i.is_message())
        .map(|i| i.token_count)
        .sum()
}

/// Oldest maximal run of message items with positive cumulative tokens,
/// truncated so adding the next message would not exceed `chunk_tokens`.
/// Always admits at least one message.
pub(crate) fn select_leaf_run(
    items: &[SequencedItem],
    fresh_tail_count: usize,
    chunk_tokens: i64,
) -> Option<Run> {
    let cut = evictable_prefix_len(items, fresh_tail_count);
    let prefix = &items[..cut];

    let mut idx = 0;
    while idx < prefix.len() {
        // Skip to the next message run.
        while idx < prefix.len() && !prefix[idx].is_message() {
            idx += 1;
        }
        let run_start = idx;
        while idx < prefix.len() && prefix[idx].is_message() {
            idx += 1;
        }
        let run = &prefix[run_start..idx];
        if run.is_empty() || run.iter().map(|i| i.token_count).sum::<i64>() == 0 {
            continue;
        }

        // Truncate the run at the chunk boundary; at least one message.
        let mut taken = Vec::new();
        let mut token_sum = 0i64;
        for item in run {
            if !taken.is_empty() && token_sum + item.token_count > chunk_tokens {
                break;
            }
            token_sum += item.token_count;
            taken.push(item);
        }
        return Some(Run {
            start_ordinal: taken.first().unwrap().ordinal,
            end_ordinal: taken.last().unwrap().ordinal,
            token_sum,
            message_ids: taken.iter().filter_map(|i| i.message_id).collect(),
            summary_ids: Vec::new(),
        });
    }
    None
}

/// Oldest maximal run of summary items all at `depth`, if it reaches
/// `min_fanout`. Runs shorter than 2 are never eligible: replacing one
/// summary with another makes no structural progress.
pub(crate) fn select_condense_run(
    items: &[SequencedItem],
    fresh_tail_count: usize,
    depth: i64,
    min_fanout: usize,
) -> Option<Run> {
    let cut = evictable_prefix_len(items, fresh_tail_count);
    let prefix = &items[..cut];
    let required = min_fanout.max(2);

    let mut idx = 0;
    while idx < prefix.len() {
        while idx < prefix.len() && prefix[idx].depth != Some(depth) {
            idx += 1;
        }
        let run_start = idx;
        while idx < prefix.len() && prefix[idx].depth == Some(depth) {
            idx += 1;
        }
        let run = &prefix[run_start..idx];
        if run.len() >= required {
            return Some(Run {
                start_ordinal: run.first().unwrap().ordinal,
                end_ordinal: run.last().unwrap().ordinal,
                token_sum: run.iter().map(|i| i.token_count).sum(),
                message_ids: Vec::new(),
                summary_ids: run.iter().filter_map(|i| i.summary_id.clone()).collect(),
            });
        }
    }
    None
}

/// Shallowest depth with an eligible condensation run, scanning summary
/// depths present in the evictable prefix in ascending order.
pub(crate) fn shallowest_eligible_depth(
    items: &[SequencedItem],
    fresh_tail_count: usize,
    min_fanout: impl Fn(i64) -> usize,
) -> Option<i64> {
    let cut = evictable_prefix_len(items, fresh_tail_count);
    let mut depths: Vec<i64> = items[..cut].iter().filter_map(|i| i.depth).collect();
    depths.sort_unstable();
    depths.dedup();
    depths
        .into_iter()
        .find(|&d| select_condense_run(items, fresh_tail_count, d, min_fanout(d)).is_some())
}
