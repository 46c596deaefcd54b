//! Per-conversation serializer.
//!
//! Every mutating operation runs inside its conversation's FIFO lane;
//! operations on distinct conversations proceed concurrently. Lanes are
//! tokio mutexes (fair, queued in arrival order) created on demand; the
//! outer map lock is held only for the O(1) lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct ConversationSerializer {
    lanes: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, conversation_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().expect("serializer lane map poisoned");
        lanes.entry(conversation_id).or_default().clone()
    }

    /// Run `op` holding the conversation's lane.
    pub async fn run<F, Fut, T>(&self, conversation_id: i64, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lane = self.lane(conversation_id);
        let _guard = lane.lock().await;
        op().await
    }
}
