//! File scanner - lists regular files directly inside the watched directory

use chrono::{DateTime, Utc};
use std::fs::{self, ReadDir};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A candidate file, derived fresh on every scan
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

impl WatchedFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub struct Scanner {
    sort_by_name: bool,
}

impl Scanner {
    pub fn new(sort_by_name: bool) -> Self {
        Self { sort_by_name }
    }

    /// Yields every non-hidden regular file in `dir` (no recursion).
    ///
    /// A missing directory yields nothing. A directory that exists but cannot
    /// be listed (permissions, not a directory) is a configuration error.
    /// With `sort_by_name` the listing is collected and sorted first;
    /// otherwise it is streamed.
    pub fn scan(&self, dir: &Path) -> Result<ScanIter> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "Watched directory does not exist yet");
                None
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "cannot list watch_dir {}: {}",
                    dir.display(),
                    e
                )));
            }
        };

        let mut iter = ScanIter {
            entries,
            sorted: None,
        };

        if self.sort_by_name {
            let mut files: Vec<WatchedFile> = iter.by_ref().collect();
            files.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
            iter.sorted = Some(files.into_iter());
        }

        Ok(iter)
    }
}

/// Single-pass iterator over scan results
pub struct ScanIter {
    entries: Option<ReadDir>,
    sorted: Option<std::vec::IntoIter<WatchedFile>>,
}

impl Iterator for ScanIter {
    type Item = WatchedFile;

    fn next(&mut self) -> Option<WatchedFile> {
        if let Some(sorted) = self.sorted.as_mut() {
            return sorted.next();
        }

        let entries = self.entries.as_mut()?;
        for entry in entries.by_ref() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Error reading directory entry");
                    continue;
                }
            };

            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }

            let path = entry.path();
            // 跟随符号链接，只接受指向普通文件的条目
            let metadata = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Cannot read file metadata");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let modified_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            return Some(WatchedFile {
                path,
                size: metadata.len(),
                modified_at,
            });
        }

        self.entries = None;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_directory_yields_nothing() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("missing");
        let files: Vec<_> = Scanner::new(true).scan(&missing).unwrap().collect();
        assert!(files.is_empty());
    }

    #[test]
    fn test_file_as_directory_is_config_error() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();

        let err = Scanner::new(true).scan(&file).err().unwrap();
        assert!(err.is_config());
        assert!(err.to_string().contains("cannot list watch_dir"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unlistable_directory_is_config_error() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let dir = temp.path().join("locked");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a.cdr"), b"a").unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o000)).unwrap();

        let result = Scanner::new(false).scan(&dir);
        let readable = fs::read_dir(&dir).is_ok();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();
        if readable {
            // root 忽略目录权限
            return;
        }
        assert!(result.err().unwrap().is_config());
    }

    #[test]
    fn test_lists_regular_files_only() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("b.cdr"), b"bb").unwrap();
        fs::write(temp.path().join("a.cdr"), b"a").unwrap();
        fs::write(temp.path().join(".partial.cdr"), b"tmp").unwrap();
        fs::create_dir(temp.path().join("archive")).unwrap();
        fs::write(temp.path().join("archive").join("old.cdr"), b"old").unwrap();

        let files: Vec<_> = Scanner::new(true).scan(temp.path()).unwrap().collect();
        let names: Vec<_> = files.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["a.cdr", "b.cdr"]);
        assert_eq!(files[0].size, 1);
        assert_eq!(files[1].size, 2);
    }

    #[test]
    fn test_unsorted_scan_streams_same_set() {
        let temp = tempdir().unwrap();
        for name in ["c.cdr", "a.cdr", "b.cdr"] {
            fs::write(temp.path().join(name), name.as_bytes()).unwrap();
        }

        let mut names: Vec<_> = Scanner::new(false)
            .scan(temp.path())
            .unwrap()
            .map(|f| f.file_name())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.cdr", "b.cdr", "c.cdr"]);
    }

    #[test]
    fn test_iterator_is_single_pass() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.cdr"), b"a").unwrap();

        let mut iter = Scanner::new(false).scan(temp.path()).unwrap();
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }
}
