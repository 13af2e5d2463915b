//! 全局同步计数器
//!
//! pts / qts / seq / date 四元组，会话生命周期内单调不减，
//! 只由引擎和 difference 合并路径修改。

use crate::protocol::UpdatesState;

/// 全局同步计数器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCounters {
    pts: u64,
    qts: u64,
    seq: u64,
    date: i64,
    inited: bool,
}

impl SyncCounters {
    pub fn new() -> Self {
        Self {
            pts: 0,
            qts: 0,
            seq: 0,
            date: 0,
            inited: false,
        }
    }

    /// difference / 登录态拉取的内嵌状态整体采纳
    pub fn init(&mut self, state: &UpdatesState) {
        self.pts = state.pts;
        if state.qts > self.qts {
            self.qts = state.qts;
        }
        self.seq = state.seq;
        if state.date > self.date {
            self.date = state.date;
        }
        self.inited = true;
    }

    pub fn pts(&self) -> u64 {
        self.pts
    }

    pub fn qts(&self) -> u64 {
        self.qts
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn date(&self) -> i64 {
        self.date
    }

    pub fn inited(&self) -> bool {
        self.inited
    }

    pub(crate) fn set_pts(&mut self, pts: u64) {
        debug_assert!(pts >= self.pts);
        self.pts = pts;
    }

    /// date 只增不减，防御分布式时间戳乱序
    pub(crate) fn bump_date(&mut self, date: i64) {
        if date > self.date {
            self.date = date;
        }
    }

    pub(crate) fn advance_seq(&mut self, seq: u64) {
        if seq > self.seq {
            self.seq = seq;
        }
    }

    /// 服务器新建会话后 seq 跟踪作废
    pub(crate) fn reset_seq(&mut self) {
        self.seq = 0;
    }
}

impl Default for SyncCounters {
    fn default() -> Self {
        Self::new()
    }
}
