//! 错误分类
//!
//! - ProviderError：单个后端失败（由 Router 吸收为健康状态与记忆，不直接外抛）
//! - RouterError：仅 NoProviderConfigured / AllProvidersExhausted 会到达外部调用方
//! - MemoryError：交互记忆写入失败，只记日志
//! - ToolError：Tool Facade 对外暴露的错误类型

use serde::Serialize;
use thiserror::Error;

/// Provider 失败的归一化类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Transport,
    Auth,
    RateLimit,
    Timeout,
    UnsupportedOperation,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Transport => "transport",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::RateLimit => "rate_limit",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::UnsupportedOperation => "unsupported_operation",
        }
    }

    /// 按 HTTP 状态码归类（各 Adapter 共用）
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ProviderErrorKind::Auth,
            429 => ProviderErrorKind::RateLimit,
            408 | 504 => ProviderErrorKind::Timeout,
            _ => ProviderErrorKind::Transport,
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider Adapter 返回的错误
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transport, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::UnsupportedOperation, message)
    }

    /// reqwest 错误归类：超时 / 状态码 / 其余视为传输错误
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if let Some(status) = err.status() {
            ProviderErrorKind::from_status(status.as_u16())
        } else {
            ProviderErrorKind::Transport
        };
        Self::new(kind, err.to_string())
    }
}

/// Router 对外可见的终止性错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("No provider configured")]
    NoProviderConfigured,

    /// 附带最后一次失败的错误签名，便于诊断
    #[error("All providers exhausted (last error: {})", .last_error.as_deref().unwrap_or("none"))]
    AllProvidersExhausted { last_error: Option<String> },

    #[error("Dispatch cancelled by caller")]
    Cancelled,
}

/// Provider 注册表构建错误（启动时）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate provider id: {0}")]
    DuplicateProvider(String),

    #[error("Unknown provider kind '{kind}' for provider {id}")]
    UnknownKind { id: String, kind: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 交互记忆存储错误（不会传播到 dispatch 调用方）
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Blocking task failed: {0}")]
    Join(String),
}

/// Tool Facade 的错误分类
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum ToolError {
    #[error("No provider configured")]
    NoProviderConfigured,

    #[error("All providers exhausted (last error: {})", .0.as_deref().unwrap_or("none"))]
    AllProvidersExhausted(Option<String>),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<RouterError> for ToolError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::NoProviderConfigured => ToolError::NoProviderConfigured,
            RouterError::AllProvidersExhausted { last_error } => {
                ToolError::AllProvidersExhausted(last_error)
            }
            RouterError::Cancelled => ToolError::Cancelled,
        }
    }
}
