//! 配置加载与校验
//!
//! 配置文件为 JSON，查找顺序：
//! 1. 命令行 `--config`
//! 2. 环境变量 `CDR_NOTIFY_CONFIG`
//! 3. `<config_dir>/cdr-notify/config.json`
//!
//! Telegram 凭据可以通过 `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID` 覆盖，
//! SMTP 密码可以通过 `SMTP_PASSWORD` 覆盖。
//! 加载完成后 `AppConfig` 不再变化，显式传入各组件。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ledger::LedgerBackend;
use crate::notification::channel::ChannelKind;
use crate::retry::RetryPolicy;

pub const CONFIG_ENV: &str = "CDR_NOTIFY_CONFIG";
pub const TELEGRAM_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";
pub const TELEGRAM_CHAT_ENV: &str = "TELEGRAM_CHAT_ID";
pub const SMTP_PASSWORD_ENV: &str = "SMTP_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 监控目录
    pub watch_dir: PathBuf,
    /// 账本后端，默认 SQLite
    #[serde(default)]
    pub ledger_backend: LedgerBackend,
    /// 账本文件路径（缺省为数据目录下按后端命名的文件）
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    /// 模板目录（缺省使用内置模板）
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
    /// 是否按文件名排序处理
    #[serde(default = "default_true")]
    pub sort_by_name: bool,
    /// 渠道发送顺序
    #[serde(default = "default_channel_order")]
    pub channel_order: Vec<ChannelKind>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub alert: AlertConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_secs: f64,
    pub multiplier: f64,
    pub max_delay_secs: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5.0,
            multiplier: 1.5,
            max_delay_secs: 3600.0,
            max_attempts: 3,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            secs_to_duration(self.base_delay_secs),
            self.multiplier,
            secs_to_duration(self.max_delay_secs),
            self.max_attempts,
        )
    }
}

/// 负数和 NaN 视为 0，溢出视为无上限
fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// 邮件投递方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTransport {
    /// 直连 SMTP 服务器
    #[default]
    Smtp,
    /// 交给本机 sendmail 兼容程序
    Sendmail,
}

/// SMTP 连接加密方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// 465 用隐式 TLS，587 用 STARTTLS，其他端口明文
    #[default]
    Auto,
    StartTls,
    Tls,
    None,
}

impl SmtpSecurity {
    /// 把 `Auto` 按端口解析为具体方式
    pub fn resolve(self, port: u16) -> SmtpSecurity {
        match (self, port) {
            (SmtpSecurity::Auto, 465) => SmtpSecurity::Tls,
            (SmtpSecurity::Auto, 587) => SmtpSecurity::StartTls,
            (SmtpSecurity::Auto, _) => SmtpSecurity::None,
            (other, _) => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub transport: EmailTransport,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_security: SmtpSecurity,
    #[serde(default = "default_email_timeout")]
    pub timeout_secs: u64,
    /// 把话单文件作为附件发送
    #[serde(default = "default_true")]
    pub attach_file: bool,
    /// sendmail 兼容程序路径，缺省自动查找
    #[serde(default)]
    pub sendmail_cmd: Option<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            from: String::new(),
            to: Vec::new(),
            transport: EmailTransport::default(),
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            smtp_security: SmtpSecurity::default(),
            timeout_secs: default_email_timeout(),
            attach_file: true,
            sendmail_cmd: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_telegram_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            timeout_secs: default_telegram_timeout(),
            api_base: default_telegram_api(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_alert_prefix")]
    pub subject_prefix: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subject_prefix: default_alert_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_channel_order() -> Vec<ChannelKind> {
    vec![ChannelKind::Email, ChannelKind::Chat]
}

fn default_smtp_port() -> u16 {
    587
}

fn default_email_timeout() -> u64 {
    30
}

fn default_telegram_timeout() -> u64 {
    10
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_alert_prefix() -> String {
    "[cdr-notify]".to_string()
}

fn default_ledger_path(backend: LedgerBackend) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cdr-notify")
        .join(backend.default_file_name())
}

/// 默认配置文件路径
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cdr-notify")
        .join("config.json")
}

/// 解析配置文件位置
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
        _ => default_config_path(),
    }
}

impl AppConfig {
    /// 从文件加载，应用环境变量覆盖并校验
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_json(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("malformed config: {}", e)))
    }

    /// 用环境变量覆盖密钥（`lookup` 便于测试注入）
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(TELEGRAM_TOKEN_ENV).filter(|v| !v.trim().is_empty()) {
            self.telegram.bot_token = token.trim().to_string();
        }
        if let Some(chat_id) = lookup(TELEGRAM_CHAT_ENV).filter(|v| !v.trim().is_empty()) {
            self.telegram.chat_id = chat_id.trim().to_string();
        }
        if let Some(password) = lookup(SMTP_PASSWORD_ENV).filter(|v| !v.is_empty()) {
            self.email.smtp_password = Some(password);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.watch_dir.as_os_str().is_empty() {
            return Err(Error::Config("watch_dir is empty".into()));
        }
        if self.watch_dir.exists() && !self.watch_dir.is_dir() {
            return Err(Error::Config(format!(
                "watch_dir is not a directory: {}",
                self.watch_dir.display()
            )));
        }
        if self.ledger_path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            return Err(Error::Config("ledger_path is empty".into()));
        }

        let retry = &self.retry;
        if !(retry.multiplier >= 1.0) {
            return Err(Error::Config(format!(
                "retry.multiplier must be >= 1, got {}",
                retry.multiplier
            )));
        }
        if !(retry.base_delay_secs >= 0.0) || !(retry.max_delay_secs >= 0.0) {
            return Err(Error::Config("retry delays must not be negative".into()));
        }
        if retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }

        if self.email.enabled {
            if self.email.from.trim().is_empty() {
                return Err(Error::Config("email.from is required when email is enabled".into()));
            }
            if self.email.to.iter().all(|to| to.trim().is_empty()) {
                return Err(Error::Config("email.to is required when email is enabled".into()));
            }
            let smtp = self.email.transport == EmailTransport::Smtp;
            if smtp && self.email.smtp_host.trim().is_empty() {
                return Err(Error::Config("email.smtp_host is required for smtp transport".into()));
            }
        }
        if self.telegram.enabled {
            if self.telegram.bot_token.trim().is_empty() {
                return Err(Error::Config(format!(
                    "telegram.bot_token (or {}) is required when telegram is enabled",
                    TELEGRAM_TOKEN_ENV
                )));
            }
            if self.telegram.chat_id.trim().is_empty() {
                return Err(Error::Config(format!(
                    "telegram.chat_id (or {}) is required when telegram is enabled",
                    TELEGRAM_CHAT_ENV
                )));
            }
        }

        if self.enabled_channels().is_empty() {
            warn!(
                "No notification channel enabled; new files will be marked notified without sending"
            );
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| default_ledger_path(self.ledger_backend))
    }

    pub fn is_enabled(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Email => self.email.enabled,
            ChannelKind::Chat => self.telegram.enabled,
        }
    }

    /// 按配置顺序返回启用的渠道（去重）
    pub fn enabled_channels(&self) -> Vec<ChannelKind> {
        let mut kinds = Vec::new();
        for kind in &self.channel_order {
            if self.is_enabled(*kind) && !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        kinds
    }

    /// 隐藏密钥后的副本，用于打印
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.telegram.bot_token.is_empty() {
            copy.telegram.bot_token = "***".to_string();
        }
        if copy.email.smtp_password.is_some() {
            copy.email.smtp_password = Some("***".to_string());
        }
        copy
    }
}
