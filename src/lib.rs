//! CDR Notify - 监控目录中新到达的话单文件，并通过邮件和 Telegram 通知
//!
//! 每次调用处理一批文件：扫描 → 指纹 → 账本去重 → 分发 → 记录结果。
//! 失败的文件按指数退避在后续调用中重试，直到重试预算耗尽。

pub mod cli;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod notification;
pub mod retry;
pub mod run;
pub mod scanner;

pub use config::AppConfig;
pub use error::{ChannelError, Error, Result};
pub use fingerprint::{fingerprint, Fingerprint};
pub use ledger::{
    open_ledger, AttemptOutcome, JsonFileLedger, Ledger, LedgerBackend, LedgerEntry, MemoryLedger,
    NotificationStatus, SqliteLedger,
};
pub use notification::{
    Alerter, ChannelKind, DispatchOutcome, NotificationChannel, NotificationDispatcher,
    NotificationMessage, SkipReason,
};
pub use retry::RetryPolicy;
pub use run::{RunController, RunSummary};
pub use scanner::{Scanner, WatchedFile};
