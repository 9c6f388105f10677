use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flairbot_core::{append_jsonl_line, JsonlRotation};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationActionKind {
    ReplyPosted,
    FinalWarningPosted,
    /// The rate budget ran out between the gate and the generation call.
    BudgetExhausted,
    GenerationFailed,
    ReplyFailed,
    FinalWarningFailed,
    DistinguishFailed,
}

#[derive(Debug, Clone, Serialize)]
/// One line in `actions.jsonl`.
pub struct ModerationActionRecord {
    pub timestamp_unix_ms: u64,
    pub kind: ModerationActionKind,
    pub thread_id: String,
    pub comment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Size-capped JSON-lines audit trail of moderation side effects.
pub struct ActionLog {
    path: PathBuf,
    rotation: JsonlRotation,
}

impl ActionLog {
    pub fn open(path: PathBuf, rotation: JsonlRotation) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        Ok(Self { path, rotation })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &ModerationActionRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to encode action record")?;
        append_jsonl_line(&self.path, &line, self.rotation)
    }
}
