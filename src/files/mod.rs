//! Large-file sidecar.
//!
//! Oversized inline file payloads are pulled out of messages at ingest time:
//! bytes go to disk under `{root}/{conversation_id}/{file_id}.{ext}`, a short
//! exploration blurb is synthesized so the model still knows what the file
//! holds, and the message part shrinks to a reference.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use std::path::PathBuf;
use uuid::Uuid;

use crate::db::models::{LargeFile, MessagePart};
use crate::error::Result;
use crate::provider::{SummarizeOptions, Summarizer};
use crate::tokenizer::{estimate_tokens, truncate_chars};

/// Size hint for exploration blurbs, in tokens.
const BLURB_TARGET_TOKENS: i64 = 200;

/// How much of the payload the blurb generator sees.
const BLURB_INPUT_CHARS: usize = 8_000;

pub struct LargeFileSidecar {
    root: PathBuf,
    threshold_tokens: i64,
}

impl LargeFileSidecar {
    pub fn new(root: PathBuf, threshold_tokens: i64) -> Self {
        Self {
            root,
            threshold_tokens,
        }
    }

    /// Scan `parts` for oversized inline file payloads, extract each to disk
    /// and rewrite the part to a compact reference. Returns the metadata rows
    /// to persist alongside the message.
    ///
    /// A filesystem failure aborts the whole ingest; a blurb failure only
    /// loses the blurb.
    pub async fn extract_parts(
        &self,
        conversation_id: i64,
        parts: &mut [MessagePart],
        summarizer: &dyn Summarizer,
    ) -> Result<Vec<LargeFile>> {
        let mut extracted = Vec::new();

        for part in parts.iter_mut() {
            let MessagePart::File {
                file_name,
                mime_type,
                content: content @ Some(_),
                file_id: file_id_slot @ None,
            } = part
            else {
                continue;
            };
            let inline = content.as_deref().unwrap_or_default();
            if estimate_tokens(inline) < self.threshold_tokens {
                continue;
            }

            // Inline payloads arrive either as UTF-8 text or base64 bytes.
            let (bytes, text_view): (Vec<u8>, Option<String>) = match BASE64.decode(inline) {
                Ok(decoded) => {
                    let view = String::from_utf8(decoded.clone()).ok();
                    (decoded, view)
                }
                Err(_) => (inline.as_bytes().to_vec(), Some(inline.to_string())),
            };

            let file_id = format!("file_{}", Uuid::new_v4().simple());
            let ext = std::path::Path::new(file_name.as_str())
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("bin")
                .to_string();
            let dir = self.root.join(conversation_id.to_string());
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join(format!("{file_id}.{ext}"));
            tokio::fs::write(&path, &bytes).await?;

            let blurb = match &text_view {
                Some(text) => {
                    let preview = truncate_chars(text, BLURB_INPUT_CHARS);
                    let prompt = format!(
                        "Describe the structure and notable contents of the file {file_name:?} \
                         so an agent can decide whether to open it:\n\n{preview}"
                    );
                    let opts = SummarizeOptions {
                        target_tokens: BLURB_TARGET_TOKENS,
                        ..Default::default()
                    };
                    match summarizer.summarize(&prompt, false, &opts).await {
                        Ok(s) if !s.trim().is_empty() => Some(s),
                        Ok(_) => None,
                        Err(e) => {
                            tracing::warn!("exploration blurb for {file_id} failed: {e}");
                            None
                        }
                    }
                }
                None => None,
            };

            tracing::info!(
                "extracted large file {file_id} ({} bytes) from conversation {conversation_id}",
                bytes.len()
            );

            extracted.push(LargeFile {
                id: file_id.clone(),
                conversation_id,
                file_name: file_name.clone(),
                mime_type: mime_type.clone(),
                byte_size: bytes.len() as i64,
                storage_uri: path.to_string_lossy().to_string(),
                exploration_summary: blurb,
                created_at: Utc::now(),
            });

            *content = None;
            *file_id_slot = Some(file_id);
        }

        Ok(extracted)
    }
}
