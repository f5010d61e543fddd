//! JSON 文件账本
//!
//! 文档结构：`{"version": 1, "processed_files": {"<fingerprint>": LedgerEntry}}`
//!
//! 每次操作都在 `<ledger>.lock` 的 fs2 文件锁保护下完成读-改-写；
//! 写入先落到临时文件再原子 rename，进程中途被杀也不会留下半截文件。
//!
//! 解析后的文档按文件戳（inode、长度、修改时间）缓存。文件未被其他进程
//! 改写时，查找和已存在条目的去重不再重新解析整个文档。

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;

use super::{unknown_fingerprint, AttemptOutcome, Ledger, LedgerEntry};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    version: u32,
    #[serde(default)]
    processed_files: BTreeMap<Fingerprint, LedgerEntry>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            processed_files: BTreeMap::new(),
        }
    }
}

/// 文件戳，任何一项变化都说明文档被改写过
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    inode: u64,
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        let inode = std::os::unix::fs::MetadataExt::ino(metadata);
        #[cfg(not(unix))]
        let inode = 0;
        Self {
            inode,
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

struct Snapshot {
    /// `None` 表示文件尚不存在
    stamp: Option<FileStamp>,
    doc: LedgerDocument,
}

pub struct JsonFileLedger {
    path: PathBuf,
    max_attempts: u32,
    snapshot: Mutex<Option<Snapshot>>,
    loads: AtomicUsize,
}

impl JsonFileLedger {
    /// 打开账本（不存在则创建目录），并确认现有文档可以解析
    pub fn open(path: impl Into<PathBuf>, max_attempts: u32) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Ledger(format!("cannot create ledger directory {}: {}", parent.display(), e))
            })?;
        }

        let ledger = Self {
            path,
            max_attempts,
            snapshot: Mutex::new(None),
            loads: AtomicUsize::new(0),
        };
        let count = ledger.with_read_lock(|doc| Ok(doc.processed_files.len()))?;
        debug!(path = %ledger.path.display(), entries = count, "Ledger opened");
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 从磁盘解析文档的次数
    pub fn document_loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    fn lock_file_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn open_lock_file(&self) -> Result<File> {
        let lock_path = self.lock_file_path();
        OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| {
                Error::Ledger(format!("cannot open lock file {}: {}", lock_path.display(), e))
            })
    }

    fn file_stamp(&self) -> Result<Option<FileStamp>> {
        match fs::metadata(&self.path) {
            Ok(metadata) => Ok(Some(FileStamp::of(&metadata))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Ledger(format!("cannot stat {}: {}", self.path.display(), e))),
        }
    }

    /// 缓存与磁盘不一致时重新读取（调用方负责加锁）
    fn refresh<'a>(&self, snapshot: &'a mut Option<Snapshot>) -> Result<&'a mut Snapshot> {
        let stamp = self.file_stamp()?;
        if let Some(current) = snapshot.take().filter(|s| s.stamp == stamp) {
            return Ok(snapshot.insert(current));
        }
        let doc = self.read_document(stamp.is_some())?;
        Ok(snapshot.insert(Snapshot { stamp, doc }))
    }

    /// 读取文档（调用方负责加锁）
    fn read_document(&self, exists: bool) -> Result<LedgerDocument> {
        if !exists {
            return Ok(LedgerDocument::default());
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        let content = fs::read_to_string(&self.path)
            .map_err(|e| Error::Ledger(format!("cannot read {}: {}", self.path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(LedgerDocument::default());
        }
        let doc: LedgerDocument = serde_json::from_str(&content)?;
        if doc.version > LEDGER_VERSION {
            return Err(Error::Ledger(format!(
                "ledger version {} is newer than supported version {}",
                doc.version, LEDGER_VERSION
            )));
        }
        Ok(doc)
    }

    /// 写入文档：临时文件 + fsync + rename（调用方负责加锁）
    fn write_document(&self, doc: &LedgerDocument) -> Result<()> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(format!(".tmp.{}", std::process::id()));
        let tmp_path = PathBuf::from(tmp_name);

        let content = serde_json::to_string_pretty(doc)?;
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            Error::Ledger(format!("cannot write {}: {}", self.path.display(), e))
        })
    }

    fn lock_snapshot(&self) -> Result<std::sync::MutexGuard<'_, Option<Snapshot>>> {
        self.snapshot
            .lock()
            .map_err(|e| Error::Ledger(format!("ledger mutex poisoned: {}", e)))
    }

    /// 在排他锁保护下执行读-改-写
    fn with_write_lock<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&mut LedgerDocument) -> Result<(T, bool)>,
    {
        let mut snapshot = self.lock_snapshot()?;
        let lock_file = self.open_lock_file()?;
        lock_file
            .lock_exclusive()
            .map_err(|e| Error::Ledger(format!("cannot lock ledger: {}", e)))?;

        let result = (|| -> Result<T> {
            let current = self.refresh(&mut snapshot)?;
            let (value, dirty) = operation(&mut current.doc)?;
            if dirty {
                self.write_document(&current.doc)?;
                current.stamp = self.file_stamp()?;
            }
            Ok(value)
        })();
        if result.is_err() {
            // 内存中的文档可能已与磁盘不一致
            *snapshot = None;
        }

        let _ = lock_file.unlock();
        result
    }

    /// 在共享锁保护下只读
    fn with_read_lock<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&LedgerDocument) -> Result<T>,
    {
        let mut snapshot = self.lock_snapshot()?;
        let lock_file = self.open_lock_file()?;
        lock_file
            .lock_shared()
            .map_err(|e| Error::Ledger(format!("cannot lock ledger: {}", e)))?;

        let result = self
            .refresh(&mut snapshot)
            .and_then(|current| operation(&current.doc));

        let _ = lock_file.unlock();
        result
    }
}

impl Ledger for JsonFileLedger {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>> {
        self.with_read_lock(|doc| Ok(doc.processed_files.get(fingerprint).cloned()))
    }

    fn insert_if_absent(
        &self,
        fingerprint: &Fingerprint,
        source_path: &str,
    ) -> Result<(LedgerEntry, bool)> {
        self.with_write_lock(|doc| {
            if let Some(existing) = doc.processed_files.get(fingerprint) {
                return Ok(((existing.clone(), false), false));
            }
            let entry = LedgerEntry::new(fingerprint.clone(), source_path);
            doc.processed_files.insert(fingerprint.clone(), entry.clone());
            Ok(((entry, true), true))
        })
    }

    fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        outcome: AttemptOutcome,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let max_attempts = self.max_attempts;
        self.with_write_lock(|doc| {
            let entry = doc
                .processed_files
                .get_mut(fingerprint)
                .ok_or_else(|| unknown_fingerprint(fingerprint))?;
            entry.apply_attempt(outcome, error, max_attempts, now);
            Ok((entry.clone(), true))
        })
    }

    fn reset(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>> {
        self.with_write_lock(|doc| match doc.processed_files.get_mut(fingerprint) {
            Some(entry) => {
                entry.reset();
                Ok((Some(entry.clone()), true))
            }
            None => Ok((None, false)),
        })
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>> {
        self.with_read_lock(|doc| {
            let mut entries: Vec<LedgerEntry> = doc.processed_files.values().cloned().collect();
            entries.sort_by_key(|e| e.first_seen_at);
            Ok(entries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;
    use crate::ledger::NotificationStatus;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    fn create_test_ledger() -> (JsonFileLedger, tempfile::TempDir) {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state").join("ledger.json");
        let ledger = JsonFileLedger::open(path, 3).unwrap();
        (ledger, temp)
    }

    #[test]
    fn test_open_empty() {
        let (ledger, _temp) = create_test_ledger();
        assert!(ledger.entries().unwrap().is_empty());
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_insert_if_absent_is_the_dedup_gate() {
        let (ledger, _temp) = create_test_ledger();
        let fp = fingerprint_bytes("a.cdr", b"a");

        let (entry, was_new) = ledger.insert_if_absent(&fp, "/srv/cdr/a.cdr").unwrap();
        assert!(was_new);
        assert_eq!(entry.notification_status, NotificationStatus::Pending);

        let (again, was_new) = ledger.insert_if_absent(&fp, "/other/a.cdr").unwrap();
        assert!(!was_new);
        assert_eq!(again, entry);
        assert_eq!(again.source_path, "/srv/cdr/a.cdr");
    }

    #[test]
    fn test_state_survives_reopen() {
        let (ledger, _temp) = create_test_ledger();
        let fp = fingerprint_bytes("a.cdr", b"a");
        ledger.insert_if_absent(&fp, "/srv/cdr/a.cdr").unwrap();
        ledger
            .record_attempt(&fp, AttemptOutcome::Failure, Some("timeout"), Utc::now())
            .unwrap();

        let reopened = JsonFileLedger::open(ledger.path(), 3).unwrap();
        let entry = reopened.lookup(&fp).unwrap().unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));
        assert!(entry.last_attempt_at.is_some());
    }

    #[test]
    fn test_document_layout() {
        let (ledger, _temp) = create_test_ledger();
        let fp = fingerprint_bytes("a.cdr", b"a");
        ledger.insert_if_absent(&fp, "/srv/cdr/a.cdr").unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(ledger.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        let entry = &raw["processed_files"][fp.as_str()];
        assert_eq!(entry["notification_status"], "pending");
        assert_eq!(entry["retry_count"], 0);
        assert_eq!(entry["fingerprint"], fp.as_str());
    }

    #[test]
    fn test_record_attempt_unknown_fingerprint_is_error() {
        let (ledger, _temp) = create_test_ledger();
        let fp = fingerprint_bytes("ghost.cdr", b"");
        let err = ledger
            .record_attempt(&fp, AttemptOutcome::Success, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::Ledger(_)));
    }

    #[test]
    fn test_exhausts_at_max_attempts() {
        let (ledger, _temp) = create_test_ledger();
        let fp = fingerprint_bytes("a.cdr", b"a");
        ledger.insert_if_absent(&fp, "/srv/cdr/a.cdr").unwrap();

        for _ in 0..2 {
            let e = ledger
                .record_attempt(&fp, AttemptOutcome::Failure, Some("x"), Utc::now())
                .unwrap();
            assert_eq!(e.notification_status, NotificationStatus::Pending);
        }
        let e = ledger
            .record_attempt(&fp, AttemptOutcome::Failure, Some("x"), Utc::now())
            .unwrap();
        assert_eq!(e.notification_status, NotificationStatus::Exhausted);

        let reset = ledger.reset(&fp).unwrap().unwrap();
        assert_eq!(reset.notification_status, NotificationStatus::Pending);
        assert_eq!(reset.retry_count, 0);
    }

    #[test]
    fn test_corrupt_document_is_ledger_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ledger.json");
        fs::write(&path, "{not json").unwrap();

        let err = JsonFileLedger::open(&path, 3).err().unwrap();
        assert!(matches!(err, Error::Ledger(_)));
    }

    #[test]
    fn test_known_entries_do_not_reparse_document() {
        let (ledger, _temp) = create_test_ledger();
        let fps: Vec<Fingerprint> = (0..300)
            .map(|i| {
                let name = format!("cdr_{:04}.csv", i);
                fingerprint_bytes(&name, name.as_bytes())
            })
            .collect();
        for fp in &fps {
            assert!(ledger.insert_if_absent(fp, "/srv/cdr/x.csv").unwrap().1);
        }
        assert_eq!(ledger.document_loads(), 0);

        // 第二轮：全部已知，只查文件戳
        for fp in &fps {
            assert!(!ledger.insert_if_absent(fp, "/srv/cdr/x.csv").unwrap().1);
            assert!(ledger.lookup(fp).unwrap().is_some());
        }
        assert_eq!(ledger.document_loads(), 0);

        // 其他进程改写后重新读取一次
        let other = JsonFileLedger::open(ledger.path(), 3).unwrap();
        let extra = fingerprint_bytes("extra.csv", b"extra");
        other.insert_if_absent(&extra, "/srv/cdr/extra.csv").unwrap();
        assert!(ledger.lookup(&extra).unwrap().is_some());
        assert!(ledger.lookup(&fps[0]).unwrap().is_some());
        assert_eq!(ledger.document_loads(), 1);
        assert_eq!(ledger.entries().unwrap().len(), 301);
    }

    #[test]
    fn test_concurrent_first_insert_has_single_winner() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ledger.json");
        let fp = fingerprint_bytes("race.cdr", b"race");
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let fp = fp.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let ledger = JsonFileLedger::open(&path, 3).unwrap();
                    barrier.wait();
                    ledger.insert_if_absent(&fp, "/srv/cdr/race.cdr").unwrap().1
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|was_new| *was_new)
            .count();
        assert_eq!(winners, 1);

        let ledger = JsonFileLedger::open(&path, 3).unwrap();
        assert_eq!(ledger.entries().unwrap().len(), 1);
    }
}
