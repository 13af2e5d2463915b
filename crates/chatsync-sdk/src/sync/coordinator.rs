//! Difference 协调器
//!
//! 每个 key（全局 / 单个频道）一台请求状态机：保证同一 key 至多一个
//! difference 在途，管理 pts 间隙短延迟重试与失败指数退避两类定时，
//! 产出待执行的请求描述符由驱动层发给传输层。
//!
//! 状态：Idle → Requesting → {Idle, WaitingRetryAfterGap, WaitingRetryAfterFailure}。
//! 退避期间 requesting 保持置位，新触发被合并进既有重试，不会发第二个请求。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::channel_table::ChannelSyncRecord;

/// 待执行的网络请求描述符
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    FullDifference { pts: u64, qts: u64, date: i64 },
    ChannelDifference {
        channel_id: u64,
        pts: u64,
        force: bool,
        limit: u32,
    },
    LivenessProbe,
}

/// 频道 difference 的触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTrigger {
    /// 显式触发（ChannelTooLong、非 final 续拉等）
    Explicit,
    /// pts 间隙短延迟到期，或 short poll 到期
    PtsGapOrShortPoll,
    /// 失败退避到期
    AfterFail,
}

#[derive(Debug)]
pub(crate) struct DifferenceCoordinator {
    pending: Vec<PendingRequest>,
    requesting_global: bool,
    global_fail_timeout: Duration,
    global_after_fail_deadline: Option<Instant>,
    channel_by_pts: HashMap<u64, Instant>,
    channel_after_fail: HashMap<u64, Instant>,
    fail_timeout_base: Duration,
    fail_timeout_max: Duration,
}

impl DifferenceCoordinator {
    pub fn new(fail_timeout_base: Duration, fail_timeout_max: Duration) -> Self {
        Self {
            pending: Vec::new(),
            requesting_global: false,
            global_fail_timeout: fail_timeout_base,
            global_after_fail_deadline: None,
            channel_by_pts: HashMap::new(),
            channel_after_fail: HashMap::new(),
            fail_timeout_base,
            fail_timeout_max,
        }
    }

    pub fn requesting_global(&self) -> bool {
        self.requesting_global
    }

    /// 进入全局 Requesting；已在途则抑制（合并触发）
    pub fn begin_global(&mut self, pts: u64, qts: u64, date: i64) -> bool {
        self.global_after_fail_deadline = None;
        if self.requesting_global {
            debug!("全局 difference 已在途，合并触发");
            return false;
        }
        self.requesting_global = true;
        self.pending.push(PendingRequest::FullDifference { pts, qts, date });
        true
    }

    /// 全局请求成功收尾，退避归位
    pub fn complete_global(&mut self) {
        self.requesting_global = false;
        self.global_fail_timeout = self.fail_timeout_base;
    }

    /// 全局请求失败：按当前退避时长安排重试并倍增（封顶）。
    /// requesting 保持置位，重试到期前的新触发都被合并。
    pub fn fail_global(&mut self, now: Instant) {
        let deadline = now + self.global_fail_timeout;
        warn!(
            "全局 difference 失败，{}s 后重试",
            self.global_fail_timeout.as_secs()
        );
        self.keep_earliest_global(deadline);
        if self.global_fail_timeout * 2 <= self.fail_timeout_max {
            self.global_fail_timeout *= 2;
        }
    }

    fn keep_earliest_global(&mut self, deadline: Instant) {
        match self.global_after_fail_deadline {
            Some(existing) if existing <= deadline => {}
            _ => self.global_after_fail_deadline = Some(deadline),
        }
    }

    /// 失败退避到期：清旗标，调用方随即重新 begin_global
    pub fn take_global_after_fail_due(&mut self, now: Instant) -> bool {
        match self.global_after_fail_deadline {
            Some(deadline) if deadline <= now => {
                self.global_after_fail_deadline = None;
                self.requesting_global = false;
                true
            }
            _ => false,
        }
    }

    /// pts 间隙 / short poll 的频道延迟重试，保留更早的期限
    pub fn schedule_channel_by_pts(&mut self, channel_id: u64, deadline: Instant) {
        let entry = self.channel_by_pts.entry(channel_id).or_insert(deadline);
        if *entry > deadline {
            *entry = deadline;
        }
    }

    /// 进入频道 Requesting；guard 条件对齐原始 getChannelDifference
    pub fn begin_channel(
        &mut self,
        channel_id: u64,
        record: &mut ChannelSyncRecord,
        trigger: ChannelTrigger,
        limit: u32,
    ) -> bool {
        if trigger != ChannelTrigger::PtsGapOrShortPoll {
            self.channel_by_pts.remove(&channel_id);
        }
        if !record.inited || record.requesting {
            return false;
        }
        if trigger != ChannelTrigger::AfterFail {
            self.channel_after_fail.remove(&channel_id);
        }
        record.requesting = true;
        // 只有间隙等待中的请求才带 force；short poll 是轻量检查
        let force = record.waiting_for_skipped_gap;
        self.pending.push(PendingRequest::ChannelDifference {
            channel_id,
            pts: record.pts,
            force,
            limit,
        });
        true
    }

    pub fn complete_channel(&mut self, channel_id: u64, record: &mut ChannelSyncRecord) {
        record.requesting = false;
        record.waiting_for_skipped_gap = false;
        record.fail_timeout = None;
        self.channel_after_fail.remove(&channel_id);
    }

    pub fn fail_channel(
        &mut self,
        channel_id: u64,
        record: &mut ChannelSyncRecord,
        now: Instant,
    ) {
        let timeout = record.fail_timeout.unwrap_or(self.fail_timeout_base);
        warn!(
            "频道 difference 失败: channel_id={}, {:?} 后重试",
            channel_id, timeout
        );
        let deadline = now + timeout;
        let entry = self.channel_after_fail.entry(channel_id).or_insert(deadline);
        if *entry > deadline {
            *entry = deadline;
        }
        record.fail_timeout = Some(if timeout * 2 <= self.fail_timeout_max {
            timeout * 2
        } else {
            timeout
        });
    }

    /// 到期的频道 pts 重试
    pub fn take_due_channel_by_pts(&mut self, now: Instant) -> Vec<u64> {
        let due: Vec<u64> = self
            .channel_by_pts
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            self.channel_by_pts.remove(id);
        }
        due
    }

    /// 到期的频道失败重试
    pub fn take_due_channel_after_fail(&mut self, now: Instant) -> Vec<u64> {
        let due: Vec<u64> = self
            .channel_after_fail
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            self.channel_after_fail.remove(id);
        }
        due
    }

    pub fn push_probe(&mut self) {
        self.pending.push(PendingRequest::LivenessProbe);
    }

    pub fn take_pending(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// 所有定时中最近的期限
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut next = self.global_after_fail_deadline;
        for deadline in self
            .channel_by_pts
            .values()
            .chain(self.channel_after_fail.values())
        {
            next = Some(match next {
                Some(current) if current <= *deadline => current,
                _ => *deadline,
            });
        }
        next
    }
}
