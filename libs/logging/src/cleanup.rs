//! Keeps the log directory from growing without bound.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Files touched more recently than this may still be open by another process.
const MIN_AGE: Duration = Duration::from_secs(300);

/// Deletes the oldest `.log` files in `log_dir` until the rest fit in `max_bytes`.
///
/// Never deletes the newest file or anything modified in the last 5 minutes.
/// Best-effort: problems are logged and skipped. Returns the number of bytes deleted.
pub fn enforce_size_cap(log_dir: &Path, max_bytes: u64) -> u64 {
    let now = SystemTime::now();

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %log_dir.display(), "Cannot read log directory: {e}");
            return 0;
        }
    };

    // (path, size, modified)
    let mut files: Vec<(PathBuf, u64, SystemTime)> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "log") {
                return None;
            }
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let modified = meta.modified().unwrap_or(now);

            Some((path, meta.len(), modified))
        })
        .collect();

    files.sort_by_key(|(_, _, modified)| *modified);

    let mut total: u64 = files.iter().map(|(_, size, _)| size).sum();
    if total <= max_bytes {
        return 0;
    }

    let Some((_newest, candidates)) = files.split_last() else {
        return 0;
    };

    let mut deleted = 0;
    for (path, size, modified) in candidates {
        if total <= max_bytes {
            break;
        }
        if now.duration_since(*modified).unwrap_or_default() < MIN_AGE {
            continue;
        }

        match fs::remove_file(path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), %size, "Deleted old log file");
                total -= size;
                deleted += size;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to delete old log file: {e}");
            }
        }
    }

    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{FileTime, set_file_mtime};

    fn write_log(dir: &Path, name: &str, size: usize, age: Duration) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![b'x'; size]).unwrap();
        let mtime = SystemTime::now() - age;
        set_file_mtime(&path, FileTime::from_system_time(mtime)).unwrap();

        path
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn deletes_oldest_first_until_under_the_cap() {
        let _guard = crate::test("debug");
        let dir = tempfile::tempdir().unwrap();
        let oldest = write_log(dir.path(), "service.1.log", 100, 3 * HOUR);
        let middle = write_log(dir.path(), "service.2.log", 100, 2 * HOUR);
        let newest = write_log(dir.path(), "service.3.log", 100, HOUR);

        let deleted = enforce_size_cap(dir.path(), 250);

        assert_eq!(deleted, 100);
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
    }

    #[test]
    fn always_keeps_the_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        let old = write_log(dir.path(), "service.1.log", 100, 2 * HOUR);
        let newest = write_log(dir.path(), "service.2.log", 1000, HOUR);

        let deleted = enforce_size_cap(dir.path(), 10);

        assert_eq!(deleted, 100);
        assert!(!old.exists());
        assert!(newest.exists());
    }

    #[test]
    fn recent_files_are_protected() {
        let dir = tempfile::tempdir().unwrap();
        let recent = write_log(dir.path(), "service.1.log", 100, Duration::from_secs(10));
        write_log(dir.path(), "service.2.log", 100, Duration::from_secs(5));

        assert_eq!(enforce_size_cap(dir.path(), 10), 0);
        assert!(recent.exists());
    }

    #[test]
    fn ignores_other_files_and_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_log(dir.path(), "settings.json", 1000, 5 * HOUR);
        write_log(dir.path(), "service.1.log", 10, HOUR);

        assert_eq!(enforce_size_cap(dir.path(), 10), 0);
        assert!(settings.exists());
        assert_eq!(enforce_size_cap(&dir.path().join("missing"), 0), 0);
    }
}
