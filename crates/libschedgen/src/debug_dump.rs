use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

/// Pretty-printed copy of a request document kept on disk while its session
/// runs. The file is removed when the guard drops, whatever path the session
/// took to get there.
#[derive(Debug)]
pub struct DebugDump {
    path: PathBuf,
}

impl DebugDump {
    pub async fn create(dir: &Path, session_id: &str, document: &Value) -> Result<Self> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let short_id: String = session_id.chars().take(8).collect();
        let path = dir.join(format!("school_data_{millis}_{short_id}.json"));

        let contents =
            serde_json::to_string_pretty(document).context("failed to serialize debug dump")?;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create debug dump dir {}", dir.display()))?;
        let dump = Self::write_at(path, contents).await?;
        debug!(path = %dump.path.display(), "wrote debug dump");
        Ok(dump)
    }

    // The guard exists before the first byte is written, so a failed write
    // still removes whatever part of the file made it to disk.
    async fn write_at(path: PathBuf, contents: String) -> Result<Self> {
        let dump = Self { path };
        tokio::fs::write(&dump.path, contents)
            .await
            .with_context(|| format!("failed to write debug dump {}", dump.path.display()))?;
        Ok(dump)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DebugDump {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed debug dump"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove debug dump"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn file_exists_until_guard_drops() {
        let dir = tempfile::tempdir().unwrap();
        let dump = DebugDump::create(dir.path(), "0123456789abcdef", &json!({"a": [1, 2]}))
            .await
            .unwrap();
        let path = dump.path().to_path_buf();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("school_data_"), "{name}");
        assert!(name.ends_with("_01234567.json"), "{name}");

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "{\n  \"a\": [\n    1,\n    2\n  ]\n}");

        drop(dump);
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("school_data_full.json");
        // Writes through this link fail with ENOSPC after the file is opened.
        std::os::unix::fs::symlink("/dev/full", &path).unwrap();

        let err = DebugDump::write_at(path.clone(), "{\"a\": 1}".repeat(1024))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("failed to write debug dump"), "{err:#}");
        assert!(std::fs::symlink_metadata(&path).is_err());
        assert!(std::path::Path::new("/dev/full").exists());
    }

    #[tokio::test]
    async fn already_removed_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dump = DebugDump::create(dir.path(), "abc", &json!(null)).await.unwrap();
        std::fs::remove_file(dump.path()).unwrap();
        drop(dump);
    }
}
