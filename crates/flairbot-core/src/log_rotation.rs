use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const DEFAULT_JSONL_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_JSONL_MAX_BACKUPS: usize = 4;

/// Size cap for an append-only JSONL file. When the next line would push the
/// active file past `max_bytes`, it is shifted to `<path>.1` and older
/// backups move up by one; at most `max_backups` are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonlRotation {
    pub max_bytes: u64,
    pub max_backups: usize,
}

impl Default for JsonlRotation {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_JSONL_MAX_BYTES,
            max_backups: DEFAULT_JSONL_MAX_BACKUPS,
        }
    }
}

impl JsonlRotation {
    /// A zero byte cap turns rotation off.
    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0
    }
}

/// Appends `line` plus a newline to `path`, rotating first when required.
pub fn append_jsonl_line(path: &Path, line: &str, rotation: JsonlRotation) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    if rotation.is_enabled() {
        let current_bytes = match std::fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => 0,
            Err(error) => {
                return Err(error).with_context(|| format!("failed to stat {}", path.display()))
            }
        };
        let incoming_bytes = u64::try_from(line.len().saturating_add(1)).unwrap_or(u64::MAX);
        if current_bytes > 0 && current_bytes.saturating_add(incoming_bytes) > rotation.max_bytes
        {
            shift_backups(path, rotation.max_backups)?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

pub fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(format!(".{index}"));
    PathBuf::from(raw)
}

fn shift_backups(path: &Path, max_backups: usize) -> Result<()> {
    if max_backups == 0 {
        return std::fs::remove_file(path)
            .with_context(|| format!("failed to discard {}", path.display()));
    }

    let oldest = backup_path(path, max_backups);
    if oldest.exists() {
        std::fs::remove_file(&oldest)
            .with_context(|| format!("failed to drop {}", oldest.display()))?;
    }
    for index in (1..max_backups).rev() {
        let from = backup_path(path, index);
        if from.exists() {
            let to = backup_path(path, index + 1);
            std::fs::rename(&from, &to).with_context(|| {
                format!("failed to move {} to {}", from.display(), to.display())
            })?;
        }
    }
    let first = backup_path(path, 1);
    std::fs::rename(path, &first)
        .with_context(|| format!("failed to move {} to {}", path.display(), first.display()))
}

#[cfg(test)]
mod tests {
    use super::{append_jsonl_line, backup_path, JsonlRotation};

    fn lines(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn functional_rotation_moves_full_file_to_first_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("actions.jsonl");
        let rotation = JsonlRotation {
            max_bytes: 20,
            max_backups: 2,
        };

        append_jsonl_line(&path, r#"{"seq":1,"k":"a"}"#, rotation).expect("first");
        append_jsonl_line(&path, r#"{"seq":2,"k":"b"}"#, rotation).expect("second");

        assert_eq!(lines(&backup_path(&path, 1)), vec![r#"{"seq":1,"k":"a"}"#]);
        assert_eq!(lines(&path), vec![r#"{"seq":2,"k":"b"}"#]);
    }

    #[test]
    fn functional_rotation_keeps_at_most_max_backups() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("actions.jsonl");
        let rotation = JsonlRotation {
            max_bytes: 12,
            max_backups: 2,
        };

        for seq in 1..=4 {
            append_jsonl_line(&path, &format!(r#"{{"seq":{seq}}}"#), rotation).expect("append");
        }

        assert_eq!(lines(&path), vec![r#"{"seq":4}"#]);
        assert_eq!(lines(&backup_path(&path, 1)), vec![r#"{"seq":3}"#]);
        assert_eq!(lines(&backup_path(&path, 2)), vec![r#"{"seq":2}"#]);
        assert!(!backup_path(&path, 3).exists());
    }

    #[test]
    fn regression_oversized_first_line_is_written_without_rotation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("actions.jsonl");
        let rotation = JsonlRotation {
            max_bytes: 4,
            max_backups: 1,
        };

        append_jsonl_line(&path, r#"{"long":"line"}"#, rotation).expect("append");

        assert_eq!(lines(&path).len(), 1);
        assert!(!backup_path(&path, 1).exists());
    }

    #[test]
    fn unit_zero_max_bytes_disables_rotation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("actions.jsonl");
        let rotation = JsonlRotation {
            max_bytes: 0,
            max_backups: 3,
        };
        for _ in 0..5 {
            append_jsonl_line(&path, r#"{"k":1}"#, rotation).expect("append");
        }
        assert_eq!(lines(&path).len(), 5);
        assert!(!backup_path(&path, 1).exists());
    }
}
