//! 单次批处理：扫描 → 逐文件分发 → 汇总

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::error::Result;
use crate::ledger::{open_ledger, Ledger};
use crate::notification::{
    build_alerter, build_channels, DispatchOutcome, NotificationDispatcher, TemplateRenderer,
};
use crate::scanner::Scanner;

/// 一次运行的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub scanned: usize,
    pub notified: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub skipped: usize,
    pub unreadable: usize,
    /// dry-run 下本应发送的文件数
    #[serde(skip_serializing_if = "is_zero")]
    pub would_notify: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl RunSummary {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Notified(_) => self.notified += 1,
            DispatchOutcome::Failed(_) => self.failed += 1,
            DispatchOutcome::Exhausted(_) => self.exhausted += 1,
            DispatchOutcome::Skipped(_) => self.skipped += 1,
            DispatchOutcome::Unreadable(_) => self.unreadable += 1,
            DispatchOutcome::WouldNotify(_) => self.would_notify += 1,
        }
    }
}

pub struct RunController {
    watch_dir: PathBuf,
    scanner: Scanner,
    dispatcher: NotificationDispatcher,
}

impl RunController {
    pub fn new(
        watch_dir: impl Into<PathBuf>,
        scanner: Scanner,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            scanner,
            dispatcher,
        }
    }

    /// 按配置组装：账本后端、启用的渠道、模板、告警器
    pub fn from_config(config: &AppConfig, dry_run: bool) -> Result<Self> {
        let ledger = open_ledger(
            config.ledger_backend,
            &config.ledger_path(),
            config.retry.max_attempts,
        )?;
        Self::with_ledger(config, ledger, dry_run)
    }

    /// 使用调用方提供的账本组装（测试或其他后端）
    pub fn with_ledger(config: &AppConfig, ledger: Arc<dyn Ledger>, dry_run: bool) -> Result<Self> {
        let renderer = TemplateRenderer::new(config.templates_dir.clone());
        let mut dispatcher = NotificationDispatcher::new(
            ledger,
            config.retry.policy(),
            Box::new(renderer),
            build_alerter(config),
        )
        .with_dry_run(dry_run);

        for channel in build_channels(config)? {
            dispatcher.register_channel(channel);
        }

        Ok(Self::new(&config.watch_dir, Scanner::new(config.sort_by_name), dispatcher))
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    /// 处理一批文件。账本错误和无法列出的监控目录中止本次运行。
    pub fn run(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        for file in self.scanner.scan(&self.watch_dir)? {
            summary.scanned += 1;
            let outcome = self.dispatcher.dispatch(&file, now)?;
            summary.record(&outcome);
        }

        info!(
            watch_dir = %self.watch_dir.display(),
            dry_run = self.dispatcher.is_dry_run(),
            scanned = summary.scanned,
            notified = summary.notified,
            failed = summary.failed,
            exhausted = summary.exhausted,
            skipped = summary.skipped,
            unreadable = summary.unreadable,
            "Run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_controller() -> (RunController, Arc<MemoryLedger>, TempDir) {
        let temp = TempDir::new().unwrap();
        let json = serde_json::json!({
            "watch_dir": temp.path(),
            "retry": {"base_delay_secs": 0.0, "max_delay_secs": 0.0}
        });
        let config = AppConfig::from_json(&json.to_string()).unwrap();
        let ledger = Arc::new(MemoryLedger::new(config.retry.max_attempts));
        let controller = RunController::with_ledger(&config, ledger.clone(), false).unwrap();
        (controller, ledger, temp)
    }

    #[test]
    fn test_run_counts_files() {
        let (controller, ledger, temp) = create_test_controller();
        fs::write(temp.path().join("a.cdr"), "a").unwrap();
        fs::write(temp.path().join("b.cdr"), "b").unwrap();
        fs::write(temp.path().join(".partial"), "c").unwrap();

        let first = controller.run(Utc::now()).unwrap();
        assert_eq!(first.scanned, 2);
        assert_eq!(first.notified, 2);

        let second = controller.run(Utc::now()).unwrap();
        assert_eq!(second.scanned, 2);
        assert_eq!(second.notified, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(ledger.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_watch_dir_is_empty_run() {
        let (controller, _, temp) = create_test_controller();
        drop(temp);
        assert_eq!(controller.run(Utc::now()).unwrap(), RunSummary::default());
    }

    #[test]
    fn test_watch_dir_replaced_by_file_aborts_run() {
        let (controller, ledger, temp) = create_test_controller();
        let watch_dir = temp.path().to_path_buf();
        drop(temp);
        fs::write(&watch_dir, "not a directory").unwrap();

        let err = controller.run(Utc::now()).unwrap_err();
        assert!(err.is_config());
        assert!(ledger.entries().unwrap().is_empty());
        fs::remove_file(&watch_dir).unwrap();
    }

    #[test]
    fn test_from_config_uses_sqlite_by_default() {
        let temp = TempDir::new().unwrap();
        let json = serde_json::json!({
            "watch_dir": temp.path().join("in"),
            "ledger_path": temp.path().join("state").join("ledger.db"),
        });
        let config = AppConfig::from_json(&json.to_string()).unwrap();
        fs::create_dir(temp.path().join("in")).unwrap();
        fs::write(temp.path().join("in").join("a.cdr"), "a").unwrap();

        let controller = RunController::from_config(&config, false).unwrap();
        assert_eq!(controller.run(Utc::now()).unwrap().notified, 1);
        assert_eq!(controller.run(Utc::now()).unwrap().skipped, 1);

        let ledger = crate::ledger::SqliteLedger::open(config.ledger_path(), 3).unwrap();
        assert_eq!(ledger.entries().unwrap().len(), 1);
    }
}
