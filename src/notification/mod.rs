//! 通知层 - 把新到达的文件分发到各通知渠道
//!
//! - `NotificationChannel`: 渠道接口，邮件与 Telegram 各自实现
//! - `NotificationDispatcher`: 单文件的 账本判断 → 发送 → 记录
//! - `Renderer`: 模板渲染协作者
//! - `Alerter`: 运维告警（尽力而为）
//!
//! ```ignore
//! use cdr_notify::notification::{build_channels, NotificationDispatcher, TemplateRenderer};
//!
//! let mut dispatcher = NotificationDispatcher::new(ledger, policy, Box::new(TemplateRenderer::default()), alerter);
//! for channel in build_channels(&config)? {
//!     dispatcher.register_channel(channel);
//! }
//! let outcome = dispatcher.dispatch(&file, Utc::now())?;
//! ```

pub mod alert;
pub mod builder;
pub mod channel;
pub mod channels;
pub mod dispatcher;
pub mod template;

pub use alert::{Alerter, ChannelAlerter, LogAlerter};
pub use builder::{build_alerter, build_channels};
pub use channel::{ChannelKind, NotificationAttempt, NotificationChannel, NotificationMessage};
pub use channels::{EmailChannel, TelegramChannel};
pub use dispatcher::{DispatchOutcome, NotificationDispatcher, SkipReason};
pub use template::{Renderer, TemplateRenderer};
