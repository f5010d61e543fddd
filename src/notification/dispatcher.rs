//! 通知分发器 - 对单个文件执行 指纹 → 账本 → 各渠道发送 → 记录结果
//!
//! 分发器本身不睡眠、不在进程内重试；退避由 `RetryPolicy::is_due`
//! 在下一次运行时判断。

use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::alert::Alerter;
use super::channel::{NotificationAttempt, NotificationChannel, NotificationMessage};
use super::template::{file_fields, Renderer, EMAIL_BODY, EMAIL_SUBJECT};
use crate::error::Result;
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::ledger::{AttemptOutcome, Ledger, LedgerEntry, NotificationStatus};
use crate::retry::RetryPolicy;
use crate::scanner::WatchedFile;

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyNotified,
    Exhausted,
    BackingOff,
}

/// 单个文件的分发结果
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// 所有启用渠道均成功
    Notified(Fingerprint),
    /// 有渠道失败，条目仍为 pending，等待下次运行
    Failed(LedgerEntry),
    /// 本次失败耗尽了重试预算
    Exhausted(LedgerEntry),
    Skipped(SkipReason),
    /// 文件无法读取（已消失或无权限）
    Unreadable(String),
    /// dry-run：本应发送
    WouldNotify(Fingerprint),
}

/// 通知分发器
pub struct NotificationDispatcher {
    ledger: Arc<dyn Ledger>,
    policy: RetryPolicy,
    renderer: Box<dyn Renderer>,
    alerter: Box<dyn Alerter>,
    /// 按配置顺序注册的渠道
    channels: Vec<Arc<dyn NotificationChannel>>,
    dry_run: bool,
    /// 本次运行已告警过的渠道（永久错误每渠道只告警一次）
    alerted_channels: RefCell<HashSet<String>>,
}

impl NotificationDispatcher {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        policy: RetryPolicy,
        renderer: Box<dyn Renderer>,
        alerter: Box<dyn Alerter>,
    ) -> Self {
        Self {
            ledger,
            policy,
            renderer,
            alerter,
            channels: Vec::new(),
            dry_run: false,
            alerted_channels: RefCell::new(HashSet::new()),
        }
    }

    /// 设置 dry-run 模式
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// 注册渠道
    pub fn register_channel(&mut self, channel: Arc<dyn NotificationChannel>) {
        debug!(channel = channel.name(), "Registering notification channel");
        self.channels.push(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// 处理一个文件。只有账本错误会返回 `Err`。
    pub fn dispatch(&self, file: &WatchedFile, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let file_name = file.file_name();
        let fp = match fingerprint(&file.path) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(file = %file_name, error = %e, "Cannot fingerprint file, skipping");
                return Ok(DispatchOutcome::Unreadable(e.to_string()));
            }
        };

        if self.dry_run {
            return self.preview(&file_name, &fp, now);
        }

        let source_path = file.path.display().to_string();
        let (entry, was_new) = self.ledger.insert_if_absent(&fp, &source_path)?;
        if was_new {
            debug!(file = %file_name, fingerprint = %fp.short(), "New file recorded");
        }

        if let Some(reason) = self.skip_reason(&entry, now) {
            debug!(file = %file_name, fingerprint = %fp.short(), reason = ?reason, "Skipping file");
            return Ok(DispatchOutcome::Skipped(reason));
        }

        let message = match self.render_message(file, &fp) {
            Ok(message) => message,
            Err(e) => {
                let detail = format!("template: {:#}", e);
                warn!(file = %file_name, error = %detail, "Cannot render notification");
                let entry = self
                    .ledger
                    .record_attempt(&fp, AttemptOutcome::Failure, Some(&detail), now)?;
                return Ok(self.failure_outcome(&file_name, entry));
            }
        };

        let attempts: Vec<NotificationAttempt> = self
            .channels
            .iter()
            .map(|channel| self.attempt(channel.as_ref(), &message))
            .collect();

        let last_error = attempts.iter().rev().find_map(|a| {
            a.error.as_ref().map(|e| format!("{}: {}", a.channel, e))
        });

        match last_error {
            None => {
                self.ledger.record_attempt(&fp, AttemptOutcome::Success, None, now)?;
                info!(
                    file = %file_name,
                    fingerprint = %fp.short(),
                    channels = attempts.len(),
                    "File notified"
                );
                Ok(DispatchOutcome::Notified(fp))
            }
            Some(detail) => {
                let entry = self
                    .ledger
                    .record_attempt(&fp, AttemptOutcome::Failure, Some(&detail), now)?;
                Ok(self.failure_outcome(&file_name, entry))
            }
        }
    }

    fn skip_reason(&self, entry: &LedgerEntry, now: DateTime<Utc>) -> Option<SkipReason> {
        match entry.notification_status {
            NotificationStatus::Notified => Some(SkipReason::AlreadyNotified),
            NotificationStatus::Exhausted => Some(SkipReason::Exhausted),
            NotificationStatus::Pending if self.policy.is_exhausted(entry.retry_count + 1) => {
                Some(SkipReason::Exhausted)
            }
            NotificationStatus::Pending if !self.policy.is_due(entry, now) => {
                Some(SkipReason::BackingOff)
            }
            NotificationStatus::Pending => None,
        }
    }

    /// dry-run 只读账本，不发送、不写入
    fn preview(
        &self,
        file_name: &str,
        fp: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let reason = match self.ledger.lookup(fp)? {
            Some(entry) => self.skip_reason(&entry, now),
            None => None,
        };
        match reason {
            Some(reason) => Ok(DispatchOutcome::Skipped(reason)),
            None => {
                info!(
                    file = %file_name,
                    fingerprint = %fp.short(),
                    channels = ?self.channel_names(),
                    "[DRY-RUN] Would notify"
                );
                Ok(DispatchOutcome::WouldNotify(fp.clone()))
            }
        }
    }

    fn render_message(
        &self,
        file: &WatchedFile,
        fp: &Fingerprint,
    ) -> anyhow::Result<NotificationMessage> {
        let fields = file_fields(file, fp);
        let subject = self.renderer.render(EMAIL_SUBJECT, &fields)?;
        let body = self.renderer.render(EMAIL_BODY, &fields)?;
        Ok(NotificationMessage::new(subject.trim(), body)
            .with_file_name(file.file_name())
            .with_attachment(&file.path))
    }

    fn attempt(
        &self,
        channel: &dyn NotificationChannel,
        message: &NotificationMessage,
    ) -> NotificationAttempt {
        match channel.send(message) {
            Ok(()) => {
                debug!(
                    channel = channel.name(),
                    file = %message.file_name,
                    "Channel send succeeded"
                );
                NotificationAttempt::success(channel.kind())
            }
            Err(e) => {
                warn!(
                    channel = channel.name(),
                    file = %message.file_name,
                    error = %e,
                    "Channel send failed"
                );
                if e.is_permanent() && self.mark_alerted(channel.name()) {
                    self.alerter.alert(
                        &format!("Channel {} is failing permanently", channel.name()),
                        &format!(
                            "File: {}\nError: {}\nFix the channel configuration; affected files \
                             stay pending until their retry budget runs out.",
                            message.file_name, e
                        ),
                    );
                }
                NotificationAttempt::failure(channel.kind(), e)
            }
        }
    }

    /// 返回该渠道本次运行是否第一次告警
    fn mark_alerted(&self, channel: &str) -> bool {
        self.alerted_channels.borrow_mut().insert(channel.to_string())
    }

    fn failure_outcome(&self, file_name: &str, entry: LedgerEntry) -> DispatchOutcome {
        match entry.notification_status {
            NotificationStatus::Exhausted => {
                let last_error = entry.last_error.clone().unwrap_or_default();
                error!(
                    file = %file_name,
                    fingerprint = %entry.fingerprint.short(),
                    attempts = entry.retry_count,
                    error = %last_error,
                    "Retry budget exhausted"
                );
                self.alerter.alert(
                    &format!("Notification failed for {}", file_name),
                    &format!(
                        "Fingerprint: {}\nAttempts: {}\nLast error: {}\n\
                         Run `cdr-notify reset {}` after fixing the cause.",
                        entry.fingerprint, entry.retry_count, last_error, entry.fingerprint
                    ),
                );
                DispatchOutcome::Exhausted(entry)
            }
            // 并发运行已经记录了成功
            NotificationStatus::Notified => DispatchOutcome::Notified(entry.fingerprint),
            NotificationStatus::Pending => {
                info!(
                    file = %file_name,
                    fingerprint = %entry.fingerprint.short(),
                    retry_count = entry.retry_count,
                    next_delay_secs = self.policy.next_delay(entry.retry_count).as_secs_f64(),
                    "Notification failed, will retry on a later run"
                );
                DispatchOutcome::Failed(entry)
            }
        }
    }
}
