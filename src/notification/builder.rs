//! 通知系统构建器 - 按配置创建渠道和告警器

use std::sync::Arc;
use tracing::{info, warn};

use super::alert::{Alerter, ChannelAlerter, LogAlerter};
use super::channel::{ChannelKind, NotificationChannel};
use super::channels::{EmailChannel, TelegramChannel};
use crate::config::AppConfig;
use crate::error::{Error, Result};

/// 按 `channel_order` 创建启用的渠道
pub fn build_channels(config: &AppConfig) -> Result<Vec<Arc<dyn NotificationChannel>>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

    for kind in config.enabled_channels() {
        match kind {
            ChannelKind::Email => {
                let channel = EmailChannel::new(&config.email)
                    .map_err(|e| Error::Config(format!("email channel: {}", e)))?;
                info!(
                    channel = "email",
                    transport = ?config.email.transport,
                    recipients = config.email.to.len(),
                    "Registering notification channel"
                );
                channels.push(Arc::new(channel));
            }
            ChannelKind::Chat => {
                let channel = TelegramChannel::new(&config.telegram)
                    .map_err(|e| Error::Config(format!("telegram channel: {}", e)))?;
                info!(
                    channel = "telegram",
                    chat_id = %config.telegram.chat_id,
                    "Registering notification channel"
                );
                channels.push(Arc::new(channel));
            }
        }
    }

    Ok(channels)
}

/// 创建告警器；告警关闭或渠道无法构建时退化为只写日志
pub fn build_alerter(config: &AppConfig) -> Box<dyn Alerter> {
    if !config.alert.enabled {
        return Box::new(LogAlerter);
    }
    match build_channels(config) {
        Ok(channels) if !channels.is_empty() => {
            Box::new(ChannelAlerter::new(channels, config.alert.subject_prefix.clone()))
        }
        Ok(_) => Box::new(LogAlerter),
        Err(e) => {
            warn!(error = %e, "Cannot build alert channels, alerts will only be logged");
            Box::new(LogAlerter)
        }
    }
}
