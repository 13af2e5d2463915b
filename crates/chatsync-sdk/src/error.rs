use thiserror::Error;

use crate::transport::TransportError;

/// SDK 错误类型
///
/// 同步引擎内部的 gap / 依赖缺失 / 可重试传输失败都会被自动恢复，
/// 不会以错误形式返回给调用方；这里只保留真正需要向外暴露的错误。
#[derive(Debug, Error)]
pub enum ChatSyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl From<serde_json::Error> for ChatSyncError {
    fn from(error: serde_json::Error) -> Self {
        ChatSyncError::Json(error.to_string())
    }
}

/// SDK Result 类型别名
pub type Result<T> = std::result::Result<T, ChatSyncError>;
