//! 错误类型
//!
//! - `Error`: 运行级错误（配置、账本、IO），出现即中止本次批处理
//! - `ChannelError`: 单个渠道的发送失败，区分临时错误和永久配置错误

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// 是否为永久配置错误
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Ledger(format!("malformed ledger document: {}", e))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Ledger(format!("sqlite: {}", e))
    }
}

/// 渠道发送错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// 网络故障、超时、限流等，下次运行可重试
    #[error("transient: {0}")]
    Transient(String),

    /// 凭据缺失、目标不存在等配置问题，需要人工处理
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ChannelError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ChannelError::Permanent(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
