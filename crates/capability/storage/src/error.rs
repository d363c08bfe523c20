//! 存储层错误类型
//!
//! 按处理方式区分两类：
//! - Unavailable：连接级失败（网络、连接池、超时），整批保留并退避重试
//! - Rejected：数据被数据库拒绝（约束、类型），只重试失败的行

/// 错误分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Unavailable,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct StorageError {
    kind: StorageErrorKind,
    message: String,
}

impl StorageError {
    /// 默认归为 Rejected。
    pub fn new(message: impl Into<String>) -> Self {
        Self::rejected(message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Unavailable,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == StorageErrorKind::Unavailable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            StorageErrorKind::Unavailable => write!(f, "storage unavailable: {}", self.message),
            StorageErrorKind::Rejected => write!(f, "storage rejected: {}", self.message),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::unavailable(message),
            sqlx::Error::Database(db) => match db.code() {
                Some(code) if is_connection_sqlstate(&code) => Self::unavailable(message),
                _ => Self::rejected(message),
            },
            _ => Self::rejected(message),
        }
    }
}

/// 08xxx 连接异常；57P01..57P03 管理员关闭/崩溃/不可连接；53300 连接数耗尽。
fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03" | "53300")
}
