//! 通知渠道 trait 定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ChannelError;
use crate::ledger::AttemptOutcome;

/// 渠道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    /// 聊天机器人（Telegram）
    Chat,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Email => f.write_str("email"),
            ChannelKind::Chat => f.write_str("chat"),
        }
    }
}

/// 通知消息（已渲染）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// 邮件主题；聊天渠道忽略
    pub subject: String,
    /// 正文
    pub body: String,
    /// 来源文件名（日志用）
    pub file_name: String,
    /// 可作为附件发送的来源文件；聊天渠道忽略
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<PathBuf>,
}

impl NotificationMessage {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            file_name: String::new(),
            attachment: None,
        }
    }

    /// 设置来源文件名
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// 设置附件文件
    pub fn with_attachment(mut self, path: impl AsRef<Path>) -> Self {
        self.attachment = Some(path.as_ref().to_path_buf());
        self
    }
}

/// 单个渠道的一次发送结果（不持久化）
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationAttempt {
    pub channel: ChannelKind,
    pub outcome: AttemptOutcome,
    pub error: Option<ChannelError>,
}

impl NotificationAttempt {
    pub fn success(channel: ChannelKind) -> Self {
        Self {
            channel,
            outcome: AttemptOutcome::Success,
            error: None,
        }
    }

    pub fn failure(channel: ChannelKind, error: ChannelError) -> Self {
        Self {
            channel,
            outcome: AttemptOutcome::Failure,
            error: Some(error),
        }
    }
}

/// 通知渠道 trait
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// 渠道名称（用于日志）
    fn name(&self) -> &str;

    /// 同步发送；超时由渠道自身负责
    fn send(&self, message: &NotificationMessage) -> Result<(), ChannelError>;
}
