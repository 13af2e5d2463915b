//! 同步配置
//!
//! 所有超时 / 退避参数都可配置，默认值对齐原始客户端的行为：
//! - seq 间隙等待约 1s
//! - 失败退避从 1s 起倍增，封顶 64s
//! - 无更新保活探测 15s，休眠唤醒后放宽到 30s

use std::time::Duration;

use crate::error::{ChatSyncError, Result};

/// 同步引擎配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// seq 间隙等待时长（超时后丢弃缓冲并强制全量 difference）
    pub wait_for_skipped: Duration,
    /// 失败退避基础时长
    pub fail_timeout_base: Duration,
    /// 失败退避上限
    pub fail_timeout_max: Duration,
    /// 无更新保活探测窗口
    pub no_updates_timeout: Duration,
    /// 休眠唤醒后的保活探测窗口
    pub no_updates_after_sleep_timeout: Duration,
    /// 频道 short poll 默认间隔（服务器未给 timeout 时使用）
    pub channel_short_poll_timeout: Duration,
    /// 单次频道 difference 拉取上限
    pub channel_difference_limit: u32,
    /// 事件广播通道容量
    pub events_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wait_for_skipped: Duration::from_secs(1),
            fail_timeout_base: Duration::from_secs(1),
            fail_timeout_max: Duration::from_secs(64),
            no_updates_timeout: Duration::from_secs(15),
            no_updates_after_sleep_timeout: Duration::from_secs(30),
            channel_short_poll_timeout: Duration::from_secs(30),
            channel_difference_limit: 100,
            events_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait_for_skipped(mut self, wait: Duration) -> Self {
        self.wait_for_skipped = wait;
        self
    }

    pub fn with_fail_timeout(mut self, base: Duration, max: Duration) -> Self {
        self.fail_timeout_base = base;
        self.fail_timeout_max = max;
        self
    }

    pub fn with_no_updates_timeout(mut self, normal: Duration, after_sleep: Duration) -> Self {
        self.no_updates_timeout = normal;
        self.no_updates_after_sleep_timeout = after_sleep;
        self
    }

    pub fn with_channel_short_poll_timeout(mut self, timeout: Duration) -> Self {
        self.channel_short_poll_timeout = timeout;
        self
    }

    pub fn with_channel_difference_limit(mut self, limit: u32) -> Self {
        self.channel_difference_limit = limit;
        self
    }

    /// 校验配置合法性
    pub fn validated(self) -> Result<Self> {
        if self.fail_timeout_base.is_zero() {
            return Err(ChatSyncError::Config(
                "fail_timeout_base must be positive".to_string(),
            ));
        }
        if self.fail_timeout_max < self.fail_timeout_base {
            return Err(ChatSyncError::Config(
                "fail_timeout_max must be >= fail_timeout_base".to_string(),
            ));
        }
        if self.channel_difference_limit == 0 {
            return Err(ChatSyncError::Config(
                "channel_difference_limit must be positive".to_string(),
            ));
        }
        Ok(self)
    }
}
