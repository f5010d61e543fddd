//! Telegram 渠道 - Bot API `sendMessage`
//!
//! 使用 reqwest 阻塞客户端，超时由配置控制。本渠道不做进程内重试，
//! 失败交给下一次运行按退避策略处理。

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::TelegramConfig;
use crate::error::ChannelError;
use crate::notification::channel::{ChannelKind, NotificationChannel, NotificationMessage};

/// Telegram `sendMessage` 文本长度上限（字符）
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

/// Telegram 渠道
pub struct TelegramChannel {
    client: Client,
    bot_token: String,
    chat_id: String,
    api_base: String,
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig) -> Result<Self, ChannelError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChannelError::Permanent(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            bot_token: config.bot_token.trim().to_string(),
            chat_id: config.chat_id.trim().to_string(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// 发送一条聊天消息
    pub fn send_chat_message(&self, chat_id: &str, body: &str) -> Result<(), ChannelError> {
        if self.bot_token.is_empty() || chat_id.is_empty() {
            return Err(ChannelError::Permanent("telegram bot token or chat id missing".into()));
        }

        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let text = truncate_message(body, TELEGRAM_MESSAGE_LIMIT);
        let payload = SendMessagePayload {
            chat_id,
            text: &text,
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .map_err(|e| {
                let detail = redact(&e.to_string(), &self.bot_token);
                ChannelError::Transient(format!("Telegram request failed: {}", detail))
            })?;

        let status = response.status();
        if status.is_success() {
            info!(channel = "telegram", chat_id = %chat_id, "Telegram message sent");
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        warn!(channel = "telegram", status = %status, error = %body, "Telegram sendMessage failed");
        Err(classify_status(status, &body))
    }
}

impl NotificationChannel for TelegramChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    fn name(&self) -> &str {
        "telegram"
    }

    fn send(&self, message: &NotificationMessage) -> Result<(), ChannelError> {
        self.send_chat_message(&self.chat_id, &message.body)
    }
}

/// 4xx 中的认证/参数/目标错误需要人工处理，其余按临时错误重试
fn classify_status(status: StatusCode, body: &str) -> ChannelError {
    let detail = format!("Telegram API error {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND => ChannelError::Permanent(detail),
        _ => ChannelError::Transient(detail),
    }
}

/// reqwest 的错误信息包含完整 URL，其中带有 token
fn redact(text: &str, token: &str) -> String {
    if token.is_empty() {
        text.to_string()
    } else {
        text.replace(token, "***")
    }
}

/// 按字符截断，超长时以省略号结尾
fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(limit.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}
