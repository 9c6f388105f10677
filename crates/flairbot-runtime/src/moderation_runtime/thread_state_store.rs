//! Per-thread moderation state and its JSON snapshot on disk.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use flairbot_core::write_text_atomic;
use serde::{Deserialize, Serialize};

pub(crate) const THREAD_STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Moderation progress for one discussion thread.
pub struct ThreadModerationState {
    pub replied_users: BTreeSet<String>,
    pub violation_count: u64,
    pub final_warning_posted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThreadStateSnapshot {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    #[serde(default)]
    replied_users: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, alias = "final_reply_posted")]
    final_warning_posted: BTreeSet<String>,
    #[serde(default)]
    violation_counts: BTreeMap<String, u64>,
}

fn default_schema_version() -> u32 {
    THREAD_STATE_SCHEMA_VERSION
}

impl ThreadStateSnapshot {
    fn from_threads(threads: &BTreeMap<String, ThreadModerationState>) -> Self {
        let mut snapshot = Self {
            schema_version: THREAD_STATE_SCHEMA_VERSION,
            replied_users: BTreeMap::new(),
            final_warning_posted: BTreeSet::new(),
            violation_counts: BTreeMap::new(),
        };
        for (thread_id, state) in threads {
            snapshot
                .replied_users
                .insert(thread_id.clone(), state.replied_users.clone());
            snapshot
                .violation_counts
                .insert(thread_id.clone(), state.violation_count);
            if state.final_warning_posted {
                snapshot.final_warning_posted.insert(thread_id.clone());
            }
        }
        snapshot
    }

    fn into_threads(self) -> BTreeMap<String, ThreadModerationState> {
        let mut threads: BTreeMap<String, ThreadModerationState> = BTreeMap::new();
        for (thread_id, users) in self.replied_users {
            threads.entry(thread_id).or_default().replied_users = users;
        }
        for (thread_id, count) in self.violation_counts {
            threads.entry(thread_id).or_default().violation_count = count;
        }
        for thread_id in self.final_warning_posted {
            threads.entry(thread_id).or_default().final_warning_posted = true;
        }
        threads
    }
}

/// In-memory thread map owned by the dispatcher, saved as a whole snapshot.
pub struct ThreadStateStore {
    path: PathBuf,
    threads: BTreeMap<String, ThreadModerationState>,
}

impl ThreadStateStore {
    /// Loads the snapshot at `path`. A missing, unreadable or malformed file
    /// yields an empty store; this never fails.
    pub fn load(path: PathBuf) -> Self {
        let threads = match read_snapshot(&path) {
            Ok(Some(snapshot)) => {
                let threads = snapshot.into_threads();
                tracing::info!(
                    state_file = %path.display(),
                    threads = threads.len(),
                    "loaded moderation state"
                );
                threads
            }
            Ok(None) => {
                tracing::info!(
                    state_file = %path.display(),
                    "no moderation state file found (starting fresh)"
                );
                BTreeMap::new()
            }
            Err(error) => {
                tracing::warn!(
                    state_file = %path.display(),
                    error = %format!("{error:#}"),
                    "ignoring unusable moderation state file (starting fresh)"
                );
                BTreeMap::new()
            }
        };
        Self { path, threads }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn thread(&self, thread_id: &str) -> Option<&ThreadModerationState> {
        self.threads.get(thread_id)
    }

    /// Returns the state for `thread_id`, creating an empty entry on first use.
    pub fn thread_mut(&mut self, thread_id: &str) -> &mut ThreadModerationState {
        self.threads.entry(thread_id.to_string()).or_default()
    }

    pub fn threads(&self) -> &BTreeMap<String, ThreadModerationState> {
        &self.threads
    }

    pub fn finalized_threads(&self) -> impl Iterator<Item = &str> {
        self.threads
            .iter()
            .filter(|(_, state)| state.final_warning_posted)
            .map(|(thread_id, _)| thread_id.as_str())
    }

    pub fn save(&self) -> Result<()> {
        let snapshot = ThreadStateSnapshot::from_threads(&self.threads);
        let mut payload = serde_json::to_string_pretty(&snapshot)
            .context("failed to serialize moderation state")?;
        payload.push('\n');
        write_text_atomic(&self.path, &payload)
            .with_context(|| format!("failed to write state file {}", self.path.display()))
    }
}

fn read_snapshot(path: &Path) -> Result<Option<ThreadStateSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    let snapshot = serde_json::from_str::<ThreadStateSnapshot>(&raw)
        .with_context(|| format!("failed to parse state file {}", path.display()))?;
    if snapshot.schema_version != THREAD_STATE_SCHEMA_VERSION {
        anyhow::bail!(
            "unsupported moderation state schema: expected {}, found {}",
            THREAD_STATE_SCHEMA_VERSION,
            snapshot.schema_version
        );
    }
    Ok(Some(snapshot))
}
