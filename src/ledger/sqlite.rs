//! SQLite 账本
//!
//! 表 `processed_files` 以指纹为主键，查找和去重都走主键索引，
//! 运行成本不随账本大小线性增长。跨进程的原子性由 SQLite 自身的锁保证：
//! 写操作在 IMMEDIATE 事务中完成，`busy_timeout` 让并发调用排队而不是报错。

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{unknown_fingerprint, AttemptOutcome, Ledger, LedgerEntry, NotificationStatus};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS processed_files (
    fingerprint         TEXT PRIMARY KEY NOT NULL,
    source_path         TEXT NOT NULL,
    first_seen_at       TEXT NOT NULL,
    notification_status TEXT NOT NULL,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    last_error          TEXT,
    last_attempt_at     TEXT
);
CREATE INDEX IF NOT EXISTS idx_processed_files_first_seen ON processed_files(first_seen_at);";

const SELECT_ENTRY: &str = "SELECT fingerprint, source_path, first_seen_at, notification_status, \
     retry_count, last_error, last_attempt_at FROM processed_files";

impl ToSql for NotificationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for NotificationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        fingerprint: Fingerprint::from_hex(row.get::<_, String>(0)?),
        source_path: row.get(1)?,
        first_seen_at: row.get(2)?,
        notification_status: row.get(3)?,
        retry_count: row.get(4)?,
        last_error: row.get(5)?,
        last_attempt_at: row.get(6)?,
    })
}

fn select_entry(conn: &Connection, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>> {
    let sql = format!("{} WHERE fingerprint = ?1", SELECT_ENTRY);
    let entry = conn
        .query_row(&sql, params![fingerprint.as_str()], entry_from_row)
        .optional()?;
    Ok(entry)
}

fn update_entry(conn: &Connection, entry: &LedgerEntry) -> Result<()> {
    conn.execute(
        "UPDATE processed_files SET notification_status = ?1, retry_count = ?2, \
         last_error = ?3, last_attempt_at = ?4 WHERE fingerprint = ?5",
        params![
            entry.notification_status,
            entry.retry_count,
            entry.last_error,
            entry.last_attempt_at,
            entry.fingerprint.as_str(),
        ],
    )?;
    Ok(())
}

pub struct SqliteLedger {
    path: PathBuf,
    conn: Mutex<Connection>,
    max_attempts: u32,
}

impl SqliteLedger {
    /// 打开账本（不存在则创建目录和表）
    pub fn open(path: impl Into<PathBuf>, max_attempts: u32) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Ledger(format!("cannot create ledger directory {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| Error::Ledger(format!("cannot open {}: {}", path.display(), e)))?;
        configure_pragmas(&conn)?;
        migrate_schema(&conn)?;

        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM processed_files", [], |row| row.get(0))?;
        debug!(path = %path.display(), entries = count, "Ledger opened");

        Ok(Self {
            path,
            conn: Mutex::new(conn),
            max_attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Ledger(format!("ledger mutex poisoned: {}", e)))
    }
}

fn configure_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn migrate_schema(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(Error::Ledger(format!(
            "ledger schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }
    conn.execute_batch(SCHEMA)?;
    if version < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        debug!(version = SCHEMA_VERSION, "Ledger schema initialized");
    }
    Ok(())
}

impl Ledger for SqliteLedger {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>> {
        let conn = self.connection()?;
        select_entry(&conn, fingerprint)
    }

    fn insert_if_absent(
        &self,
        fingerprint: &Fingerprint,
        source_path: &str,
    ) -> Result<(LedgerEntry, bool)> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let entry = LedgerEntry::new(fingerprint.clone(), source_path);
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO processed_files \
             (fingerprint, source_path, first_seen_at, notification_status, retry_count) \
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                fingerprint.as_str(),
                entry.source_path,
                entry.first_seen_at,
                entry.notification_status,
            ],
        )?;

        let result = if inserted == 1 {
            (entry, true)
        } else {
            let existing =
                select_entry(&tx, fingerprint)?.ok_or_else(|| unknown_fingerprint(fingerprint))?;
            (existing, false)
        };
        tx.commit()?;
        Ok(result)
    }

    fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        outcome: AttemptOutcome,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut entry =
            select_entry(&tx, fingerprint)?.ok_or_else(|| unknown_fingerprint(fingerprint))?;
        entry.apply_attempt(outcome, error, self.max_attempts, now);
        update_entry(&tx, &entry)?;
        tx.commit()?;
        Ok(entry)
    }

    fn reset(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut entry) = select_entry(&tx, fingerprint)? else {
            return Ok(None);
        };
        entry.reset();
        update_entry(&tx, &entry)?;
        tx.commit()?;
        Ok(Some(entry))
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let conn = self.connection()?;
        let sql = format!("{} ORDER BY first_seen_at, fingerprint", SELECT_ENTRY);
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}
