//! 带外告警 - 运行失败或渠道永久错误时通知运维
//!
//! 告警是尽力而为的：发送失败只记日志，绝不覆盖或替换原始错误。

use std::sync::Arc;
use tracing::{error, info, warn};

use super::channel::{NotificationChannel, NotificationMessage};

pub trait Alerter {
    fn alert(&self, subject: &str, body: &str);
}

/// 通过已配置渠道发送告警
pub struct ChannelAlerter {
    channels: Vec<Arc<dyn NotificationChannel>>,
    subject_prefix: String,
}

impl ChannelAlerter {
    pub fn new(
        channels: Vec<Arc<dyn NotificationChannel>>,
        subject_prefix: impl Into<String>,
    ) -> Self {
        Self {
            channels,
            subject_prefix: subject_prefix.into(),
        }
    }
}

impl Alerter for ChannelAlerter {
    fn alert(&self, subject: &str, body: &str) {
        if self.channels.is_empty() {
            warn!(subject = %subject, "No alert channel available, alert only logged");
            return;
        }

        let subject = format!("{} {}", self.subject_prefix, subject).trim().to_string();
        let message = NotificationMessage::new(subject.clone(), format!("{}\n\n{}", subject, body));

        for channel in &self.channels {
            match channel.send(&message) {
                Ok(()) => info!(channel = channel.name(), "Alert sent"),
                Err(e) => error!(channel = channel.name(), error = %e, "Failed to send alert"),
            }
        }
    }
}

/// 只写日志的告警器（告警关闭或渠道无法构建时使用）
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert(&self, subject: &str, body: &str) {
        error!(subject = %subject, body = %body, "ALERT");
    }
}
