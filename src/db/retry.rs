//! Retry helper for transient SQLite contention.
//!
//! WAL mode plus the per-conversation serializer make lock contention rare,
//! but a reader checkpoint can still surface SQLITE_BUSY. Writes that matter
//! go through here with a short exponential backoff.

use std::time::Duration;

use crate::error::{LcmError, Result};

#[derive(Debug, Clone)]
pub struct DbRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for DbRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

/// True for errors worth retrying: lock contention, not logic errors.
fn is_transient(err: &LcmError) -> bool {
    match err {
        LcmError::Database(msg) => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}

/// Run `op` until it succeeds, the error is non-transient, or attempts run out.
pub async fn retry_db_operation<T, F, Fut>(
    config: &DbRetryConfig,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = config.base_delay_ms;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < config.max_attempts => {
                tracing::warn!(
                    "db operation {op_name} hit contention (attempt {attempt}/{}): {err}",
                    config.max_attempts
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = (delay * 2).min(config.max_delay_ms);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
