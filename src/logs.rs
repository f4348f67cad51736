use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Extension of the flow files written by mitmproxy's `-w` option
pub const LOG_EXTENSION: &str = "mitm";

/// Directory of per-run flow logs with a fixed retention count
#[derive(Clone, Debug)]
pub struct LogDirectory {
    dir: PathBuf,
    retention: usize,
}

impl LogDirectory {
    pub fn new(dir: PathBuf, retention: usize) -> Self {
        LogDirectory { dir, retention }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Remove the oldest flow logs so that at most `retention` remain
    ///
    /// Returns the removed paths. Files that cannot be removed are logged
    /// and skipped.
    pub fn prune(&self) -> io::Result<Vec<PathBuf>> {
        let mut logs: Vec<(SystemTime, PathBuf)> = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            logs.push((modified, path));
        }

        if logs.len() <= self.retention {
            return Ok(Vec::new());
        }

        // Newest first; name breaks ties so the result is deterministic
        logs.sort_by(|a, b| b.cmp(a));

        let mut removed = Vec::new();
        for (_, path) in logs.into_iter().skip(self.retention) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed old flow log {}", path.display());
                    removed.push(path);
                }
                Err(e) => warn!("Failed to remove old flow log {}: {}", path.display(), e),
            }
        }

        Ok(removed)
    }

    /// Path of the flow log for a run launched at `now`
    pub fn log_path_at(&self, now: DateTime<Local>) -> PathBuf {
        self.dir.join(format!(
            "flows-{}.{}",
            now.format("%Y%m%d-%H%M%S"),
            LOG_EXTENSION
        ))
    }

    pub fn next_log_path(&self) -> PathBuf {
        self.log_path_at(Local::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::tempdir;

    fn touch(path: &Path, age_secs: u64) {
        let file = File::create(path).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempdir().unwrap();
        let logs = LogDirectory::new(dir.path().to_path_buf(), 10);

        // flows-00 is the oldest, flows-14 the newest
        for i in 0..15u64 {
            touch(&dir.path().join(format!("flows-{:02}.mitm", i)), 1000 - i * 10);
        }

        let mut removed = logs.prune().unwrap();
        removed.sort();

        let expected: Vec<PathBuf> = (0..5)
            .map(|i| dir.path().join(format!("flows-{:02}.mitm", i)))
            .collect();
        assert_eq!(removed, expected);

        for i in 5..15 {
            assert!(dir.path().join(format!("flows-{:02}.mitm", i)).exists());
        }
    }

    #[test]
    fn test_prune_under_retention_is_noop() {
        let dir = tempdir().unwrap();
        let logs = LogDirectory::new(dir.path().to_path_buf(), 10);
        for i in 0..10u64 {
            touch(&dir.path().join(format!("flows-{}.mitm", i)), i);
        }

        assert!(logs.prune().unwrap().is_empty());
    }

    #[test]
    fn test_prune_ignores_other_files() {
        let dir = tempdir().unwrap();
        let logs = LogDirectory::new(dir.path().to_path_buf(), 1);
        touch(&dir.path().join("notes.txt"), 500);
        touch(&dir.path().join("old.mitm"), 400);
        touch(&dir.path().join("new.mitm"), 1);
        fs::create_dir(dir.path().join("dir.mitm")).unwrap();

        let removed = logs.prune().unwrap();

        assert_eq!(removed, vec![dir.path().join("old.mitm")]);
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("new.mitm").exists());
        assert!(dir.path().join("dir.mitm").is_dir());
    }

    #[test]
    fn test_log_path_uses_launch_timestamp() {
        let logs = LogDirectory::new(PathBuf::from("/var/logs"), 10);
        let when = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        assert_eq!(
            logs.log_path_at(when),
            PathBuf::from("/var/logs/flows-20240309-070502.mitm")
        );
    }

    #[test]
    fn test_ensure_creates_directory() {
        let dir = tempdir().unwrap();
        let logs = LogDirectory::new(dir.path().join("logs"), 10);
        logs.ensure().unwrap();
        assert!(logs.path().is_dir());
    }
}
