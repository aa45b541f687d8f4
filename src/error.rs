//! 统一错误模型
//!
//! 错误分为三层：
//! - [`SecretError`]：凭据解析阶段的错误
//! - [`RunError`]：整次运行致命的错误（堡垒机不可用等），直接作为 `Err` 返回
//! - [`HostError`]：单台主机的错误，只会作为数据出现在 `ExecutionResult.error` 中

use serde::{Deserialize, Serialize};

/// 结果类型别名
pub type Result<T> = std::result::Result<T, RunError>;

/// 凭据解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    Unavailable(String),

    #[error("Secret access denied: {0}")]
    AccessDenied(String),

    #[error("Secret is not a usable private key: {0}")]
    Malformed(String),
}

impl SecretError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        SecretError::Unavailable(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        SecretError::AccessDenied(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        SecretError::Malformed(msg.into())
    }

    /// 对应的主机级错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecretError::Unavailable(_) => ErrorKind::SecretUnavailable,
            SecretError::AccessDenied(_) => ErrorKind::SecretAccessDenied,
            SecretError::Malformed(_) => ErrorKind::SecretMalformed,
        }
    }
}

/// 运行级致命错误：发生时不会产生任何报告
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Bastion unreachable: {0}")]
    BastionUnreachable(String),

    #[error("Bastion authentication failed: {0}")]
    BastionAuthFailed(String),

    #[error("Bastion credential unavailable: {0}")]
    BastionCredential(#[from] SecretError),

    #[error("Invalid inventory: {0}")]
    InventoryInvalid(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl RunError {
    pub fn unreachable(msg: impl Into<String>) -> Self {
        RunError::BastionUnreachable(msg.into())
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        RunError::BastionAuthFailed(msg.into())
    }

    pub fn inventory(msg: impl Into<String>) -> Self {
        RunError::InventoryInvalid(msg.into())
    }

    /// 命令行退出码
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// 主机级错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SecretUnavailable,
    SecretAccessDenied,
    SecretMalformed,
    RelayRefused,
    TargetAuthFailed,
    CommandTimeout,
    ChannelClosed,
    /// 任务本身异常退出（panic）
    TaskAborted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SecretUnavailable => "secret_unavailable",
            ErrorKind::SecretAccessDenied => "secret_access_denied",
            ErrorKind::SecretMalformed => "secret_malformed",
            ErrorKind::RelayRefused => "relay_refused",
            ErrorKind::TargetAuthFailed => "target_auth_failed",
            ErrorKind::CommandTimeout => "command_timeout",
            ErrorKind::ChannelClosed => "channel_closed",
            ErrorKind::TaskAborted => "task_aborted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单台主机的错误，作为数据记录在执行结果中
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HostError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HostError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn relay_refused(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::RelayRefused, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TargetAuthFailed, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandTimeout, msg)
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChannelClosed, msg)
    }
}

impl From<SecretError> for HostError {
    fn from(e: SecretError) -> Self {
        HostError::new(e.kind(), e.to_string())
    }
}
