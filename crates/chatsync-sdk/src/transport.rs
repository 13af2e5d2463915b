//! 传输层协作方
//!
//! 引擎只消费这三个接口：全量 difference、频道 difference、保活探测。
//! 请求的发起与响应回灌由 `SyncService` 驱动，引擎本身不持有连接。

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{ChannelDifference, Difference};

/// 传输层错误
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error [{code}]: {message}")]
    Server { code: u16, message: String },

    #[error("Request timeout")]
    Timeout,

    /// 传输层已经全局处理过（自行重试 / 记录），引擎忽略即可
    #[error("Already handled by transport: {0}")]
    DefaultHandled(String),
}

impl TransportError {
    /// 是否已被传输层全局处理
    pub fn default_handled(&self) -> bool {
        matches!(self, TransportError::DefaultHandled(_))
    }
}

/// 传输层接口
#[async_trait]
pub trait Transport: Send + Sync {
    /// 全量 / 增量 difference 拉取
    async fn request_full_difference(
        &self,
        pts: u64,
        qts: u64,
        date: i64,
    ) -> std::result::Result<Difference, TransportError>;

    /// 频道 difference 拉取；`force` 区分强制补齐与 short poll 检查
    async fn request_channel_difference(
        &self,
        channel_id: u64,
        pts: u64,
        force: bool,
        limit: u32,
    ) -> std::result::Result<ChannelDifference, TransportError>;

    /// 保活探测（fire-and-forget）
    async fn send_liveness_probe(&self);
}
