//! seq 乱序缓冲
//!
//! 先于前驱到达的 seq 信封按 seq 暂存；前驱补齐后按升序连续释放，
//! 等待超时则整体丢弃并强制全量 difference（靠等待已无法恢复）。

use std::collections::BTreeMap;
use std::time::Instant;

use crate::protocol::UpdateEnvelope;

#[derive(Debug, Default)]
pub struct GapBuffer {
    entries: BTreeMap<u64, UpdateEnvelope>,
    deadline: Option<Instant>,
}

impl GapBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 暂存一条超前信封；等待计时只在未运行时拉起，
    /// 持续的乱序到达不能无限推后强制补齐
    pub fn insert(&mut self, seq: u64, envelope: UpdateEnvelope, deadline: Instant) {
        self.entries.insert(seq, envelope);
        if self.deadline.is_none() {
            self.deadline = Some(deadline);
        }
    }

    /// 丢弃所有 `<= local_seq` 的过期项；若下一个恰好是 `local_seq + 1` 则弹出。
    /// 缓冲清空时停掉计时器。
    pub fn release_next(&mut self, local_seq: u64) -> Option<UpdateEnvelope> {
        let stale: Vec<u64> = self
            .entries
            .range(..=local_seq)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in stale {
            self.entries.remove(&seq);
        }
        let released = self.entries.remove(&(local_seq + 1));
        if self.entries.is_empty() {
            self.deadline = None;
        }
        released
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 缓冲仍有未释放项时延长等待
    pub fn rearm(&mut self, deadline: Instant) {
        if !self.entries.is_empty() {
            self.deadline = Some(deadline);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadline = None;
    }
}
