//! 去重账本 - 记录每个指纹的通知状态
//!
//! 账本是“是否为新文件”的唯一事实来源。`insert_if_absent` 是唯一的去重关口：
//! 只有返回 `was_new = true` 时指纹才算新文件。
//!
//! 后端：
//! - `SqliteLedger`: 默认持久化后端，主键索引，SQLite 锁保证跨进程原子性
//! - `JsonFileLedger`: 持久化 JSON 文件，fs2 文件锁保证跨进程原子性
//! - `MemoryLedger`: 内存实现，用于测试

pub mod json_file;
pub mod memory;
pub mod sqlite;

pub use json_file::JsonFileLedger;
pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// 通知状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    /// 等待发送或等待重试
    Pending,
    /// 所有启用渠道均已成功
    Notified,
    /// 重试预算耗尽
    Exhausted,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Notified => "notified",
            NotificationStatus::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "notified" => Ok(NotificationStatus::Notified),
            "exhausted" => Ok(NotificationStatus::Exhausted),
            other => Err(Error::Ledger(format!("unknown notification status: {}", other))),
        }
    }
}

/// 持久化后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    #[default]
    Sqlite,
    Json,
}

impl LedgerBackend {
    /// 未配置路径时使用的文件名
    pub fn default_file_name(&self) -> &'static str {
        match self {
            LedgerBackend::Sqlite => "ledger.db",
            LedgerBackend::Json => "ledger.json",
        }
    }
}

/// 按后端打开持久化账本
pub fn open_ledger(
    backend: LedgerBackend,
    path: &Path,
    max_attempts: u32,
) -> Result<Arc<dyn Ledger>> {
    Ok(match backend {
        LedgerBackend::Sqlite => Arc::new(SqliteLedger::open(path, max_attempts)?),
        LedgerBackend::Json => Arc::new(JsonFileLedger::open(path, max_attempts)?),
    })
}

/// 一次分发的汇总结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// 账本条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub fingerprint: Fingerprint,
    pub source_path: String,
    pub first_seen_at: DateTime<Utc>,
    pub notification_status: NotificationStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// 首次发现时创建的 pending 条目
    pub fn new(fingerprint: Fingerprint, source_path: impl Into<String>) -> Self {
        Self {
            fingerprint,
            source_path: source_path.into(),
            first_seen_at: Utc::now(),
            notification_status: NotificationStatus::Pending,
            retry_count: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    /// 应用一次尝试结果（各后端共用的状态转换）
    ///
    /// 已经 notified 的条目保持不变，保证成功最多记录一次。
    pub(crate) fn apply_attempt(
        &mut self,
        outcome: AttemptOutcome,
        error: Option<&str>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) {
        if self.notification_status == NotificationStatus::Notified {
            return;
        }

        self.last_attempt_at = Some(now);
        match outcome {
            AttemptOutcome::Success => {
                self.notification_status = NotificationStatus::Notified;
                self.last_error = None;
            }
            AttemptOutcome::Failure => {
                self.retry_count = self.retry_count.saturating_add(1);
                self.last_error = error.map(|e| e.to_string());
                self.notification_status = if self.retry_count >= max_attempts {
                    NotificationStatus::Exhausted
                } else {
                    NotificationStatus::Pending
                };
            }
        }
    }

    /// 人工处理后重新放回 pending
    pub(crate) fn reset(&mut self) {
        self.notification_status = NotificationStatus::Pending;
        self.retry_count = 0;
        self.last_error = None;
    }
}

/// 账本接口，所有操作对并发进程原子
pub trait Ledger {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>>;

    /// 不存在时创建 pending 条目；已存在时原样返回，`was_new = false`
    fn insert_if_absent(
        &self,
        fingerprint: &Fingerprint,
        source_path: &str,
    ) -> Result<(LedgerEntry, bool)>;

    /// `now` 记为 `last_attempt_at`，与退避判断使用同一时钟
    fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        outcome: AttemptOutcome,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry>;

    /// 人工处理：把条目重置为 pending
    fn reset(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>>;

    /// 所有条目，按 first_seen_at 排序
    fn entries(&self) -> Result<Vec<LedgerEntry>>;
}

pub(crate) fn unknown_fingerprint(fingerprint: &Fingerprint) -> Error {
    Error::Ledger(format!("no ledger entry for fingerprint {}", fingerprint))
}
