//! 邮件渠道 - 基于 lettre 构造 MIME 邮件
//!
//! 投递方式：
//! - SMTP：465 隐式 TLS，587 STARTTLS，配置了用户名和密码时登录
//! - sendmail：交给本机 sendmail 兼容程序
//!
//! 非 ASCII 的主题和地址由 lettre 按 RFC 2047 编码；话单文件可作为附件发送。

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::{sendmail, smtp};
use lettre::{Message, SendmailTransport, SmtpTransport, Transport};
use std::error::Error as _;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

use crate::config::{EmailConfig, EmailTransport, SmtpSecurity};
use crate::error::ChannelError;
use crate::notification::channel::{ChannelKind, NotificationChannel, NotificationMessage};

enum Mailer {
    Smtp(SmtpTransport),
    Sendmail(SendmailTransport),
}

/// 邮件渠道
pub struct EmailChannel {
    from: Mailbox,
    to: Vec<String>,
    attach_file: bool,
    mailer: Mailer,
}

impl EmailChannel {
    /// 解析地址并准备传输层；不会连接服务器
    pub fn new(config: &EmailConfig) -> Result<Self, ChannelError> {
        let from: Mailbox = config.from.trim().parse().map_err(|e| {
            ChannelError::Permanent(format!("invalid email.from {:?}: {}", config.from, e))
        })?;

        let mailer = match config.transport {
            EmailTransport::Smtp => Mailer::Smtp(build_smtp_transport(config)?),
            EmailTransport::Sendmail => {
                let cmd = config
                    .sendmail_cmd
                    .clone()
                    .filter(|cmd| !cmd.trim().is_empty())
                    .unwrap_or_else(Self::find_sendmail_path);
                Mailer::Sendmail(SendmailTransport::new_with_command(cmd))
            }
        };

        Ok(Self {
            from,
            to: config
                .to
                .iter()
                .map(|to| to.trim().to_string())
                .filter(|to| !to.is_empty())
                .collect(),
            attach_file: config.attach_file,
            mailer,
        })
    }

    /// 发送一封纯文本邮件
    pub fn send_email(&self, to: &[String], subject: &str, body: &str) -> Result<(), ChannelError> {
        let message = self.build_message(to, subject, body, None)?;
        self.deliver(&message, to.len(), subject)
    }

    /// 构造邮件；`attachment` 为要附上的文件
    pub fn build_message(
        &self,
        to: &[String],
        subject: &str,
        body: &str,
        attachment: Option<&Path>,
    ) -> Result<Message, ChannelError> {
        if to.is_empty() {
            return Err(ChannelError::Permanent("no email recipients configured".into()));
        }

        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for recipient in to {
            let mailbox: Mailbox = recipient.parse().map_err(|e| {
                ChannelError::Permanent(format!("invalid recipient {:?}: {}", recipient, e))
            })?;
            builder = builder.to(mailbox);
        }

        let text = SinglePart::plain(body.to_string());
        let built = match attachment {
            Some(path) => {
                let content = fs::read(path).map_err(|e| {
                    ChannelError::Transient(format!("cannot attach {}: {}", path.display(), e))
                })?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let file = Attachment::new(filename).body(content, ContentType::TEXT_PLAIN);
                builder.multipart(MultiPart::mixed().singlepart(text).singlepart(file))
            }
            None => builder.singlepart(text),
        };

        built.map_err(|e| ChannelError::Permanent(format!("cannot build email: {}", e)))
    }

    fn deliver(
        &self,
        message: &Message,
        recipients: usize,
        subject: &str,
    ) -> Result<(), ChannelError> {
        let result = match &self.mailer {
            Mailer::Smtp(transport) => transport.send(message).map(|_| ()).map_err(classify_smtp),
            Mailer::Sendmail(transport) => transport.send(message).map_err(classify_sendmail),
        };

        match &result {
            Ok(()) => info!(channel = "email", recipients, subject = %subject, "Email sent"),
            Err(e) => error!(channel = "email", error = %e, "Email delivery failed"),
        }
        result
    }

    /// 查找 sendmail 可执行文件路径
    fn find_sendmail_path() -> String {
        if let Ok(path) = which::which("sendmail") {
            return path.to_string_lossy().to_string();
        }

        // cron 环境的 PATH 通常不含 sbin
        for path in &["/usr/sbin/sendmail", "/usr/lib/sendmail"] {
            if Path::new(path).exists() {
                return path.to_string();
            }
        }

        "/usr/sbin/sendmail".to_string()
    }
}

fn build_smtp_transport(config: &EmailConfig) -> Result<SmtpTransport, ChannelError> {
    let host = config.smtp_host.trim();
    if host.is_empty() {
        return Err(ChannelError::Permanent("email.smtp_host is not configured".into()));
    }

    let tls_error = |e: smtp::Error| ChannelError::Permanent(format!("smtp tls setup: {}", e));
    let builder = match config.smtp_security.resolve(config.smtp_port) {
        SmtpSecurity::Tls => SmtpTransport::relay(host).map_err(tls_error)?,
        SmtpSecurity::StartTls => SmtpTransport::starttls_relay(host).map_err(tls_error)?,
        SmtpSecurity::None | SmtpSecurity::Auto => SmtpTransport::builder_dangerous(host),
    };

    let mut builder = builder
        .port(config.smtp_port)
        .timeout(Some(Duration::from_secs(config.timeout_secs)));
    if let (Some(user), Some(password)) = (&config.smtp_username, &config.smtp_password) {
        if !user.is_empty() && !password.is_empty() {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
    }
    Ok(builder.build())
}

/// 5xx 回复（认证失败、收件人被拒）需要人工处理，其余可重试
fn classify_smtp(e: smtp::Error) -> ChannelError {
    if e.is_permanent() {
        ChannelError::Permanent(format!("smtp: {}", e))
    } else {
        ChannelError::Transient(format!("smtp: {}", e))
    }
}

/// 程序不存在或不可执行是永久错误，非零退出可重试
fn classify_sendmail(e: sendmail::Error) -> ChannelError {
    let kind = e
        .source()
        .and_then(|source| source.downcast_ref::<io::Error>())
        .map(|io_error| io_error.kind());
    match kind {
        Some(io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
            ChannelError::Permanent(format!("sendmail: {}", e))
        }
        _ => ChannelError::Transient(format!("sendmail: {}", e)),
    }
}

impl NotificationChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn name(&self) -> &str {
        "email"
    }

    fn send(&self, message: &NotificationMessage) -> Result<(), ChannelError> {
        let attachment = message.attachment.as_deref().filter(|_| self.attach_file);
        let email = self.build_message(&self.to, &message.subject, &message.body, attachment)?;
        self.deliver(&email, self.to.len(), &message.subject)
    }
}
