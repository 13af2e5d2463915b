//! 频道同步表
//!
//! 每个频道一条独立的 `{pts, requesting, ...}` 记录，按需懒创建，
//! 会话期内不主动销毁（可由 difference 重建，内存压力下可安全淘汰）。

use std::collections::HashMap;
use std::time::Duration;

/// 单个频道的同步记录
#[derive(Debug, Clone)]
pub struct ChannelSyncRecord {
    pub pts: u64,
    pub inited: bool,
    /// 该频道是否有 difference 在途（含退避等待期）
    pub requesting: bool,
    /// 检测到 pts 间隙、等待短延迟重试中
    pub waiting_for_skipped_gap: bool,
    /// 连续失败的当前退避时长；None 表示下次失败从配置基准开始
    pub fail_timeout: Option<Duration>,
}

impl ChannelSyncRecord {
    fn new() -> Self {
        Self {
            pts: 0,
            inited: false,
            requesting: false,
            waiting_for_skipped_gap: false,
            fail_timeout: None,
        }
    }

    pub fn init_pts(&mut self, pts: u64) {
        self.pts = pts;
        self.inited = true;
    }
}

/// 频道 id -> 同步记录
#[derive(Debug, Default)]
pub struct ChannelSyncTable {
    records: HashMap<u64, ChannelSyncRecord>,
}

impl ChannelSyncTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 懒创建记录
    pub fn record_for(&mut self, channel_id: u64) -> &mut ChannelSyncRecord {
        self.records
            .entry(channel_id)
            .or_insert_with(ChannelSyncRecord::new)
    }

    pub fn get(&self, channel_id: u64) -> Option<&ChannelSyncRecord> {
        self.records.get(&channel_id)
    }

    pub fn mark_requesting(&mut self, channel_id: u64, requesting: bool) {
        self.record_for(channel_id).requesting = requesting;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
