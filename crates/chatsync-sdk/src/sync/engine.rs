//! 同步引擎
//!
//! 推送信封与 difference 结果的唯一入口：分类信封、做 pts / seq /
//! 依赖检查，决定"立即应用"还是"发起重同步"，并维护保活探测。
//!
//! 引擎是单线程协作模型的同步状态机：网络请求只以 `PendingRequest`
//! 描述符的形式排队，由驱动层（`SyncService`）取走执行，响应通过
//! `apply_*` / `fail_*` 回灌。定时全部表达为期限，`handle_time` 驱动。

use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::events::{EventManager, SyncEvent};
use crate::protocol::{
    ChannelDifference, Difference, FwdHeader, Message, MessageEntity, Peer, Update,
    UpdateEnvelope, UpdatesState,
};
use crate::store::{MergeOrder, ObjectStore};
use crate::sync::applier;
use crate::sync::channel_table::ChannelSyncTable;
use crate::sync::coordinator::{ChannelTrigger, DifferenceCoordinator, PendingRequest};
use crate::sync::counters::SyncCounters;
use crate::sync::deps;
use crate::sync::gap_buffer::GapBuffer;
use crate::transport::TransportError;

/// pts 差值判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PtsCheck {
    /// 恰好衔接，可以应用
    Apply,
    /// 超前，存在间隙
    Gap,
    /// 已应用过的旧信封
    Stale,
}

fn check_pts(local: u64, pts: u64, pts_count: u32) -> PtsCheck {
    if local + pts_count as u64 == pts {
        PtsCheck::Apply
    } else if pts > local {
        PtsCheck::Gap
    } else {
        PtsCheck::Stale
    }
}

/// 同步引擎
pub struct SyncEngine<S: ObjectStore> {
    config: SyncConfig,
    counters: SyncCounters,
    channels: ChannelSyncTable,
    gap_buffer: GapBuffer,
    coordinator: DifferenceCoordinator,
    store: S,
    events: EventManager,
    no_updates_deadline: Option<Instant>,
}

impl<S: ObjectStore> SyncEngine<S> {
    pub fn new(store: S, config: SyncConfig) -> Self {
        let coordinator =
            DifferenceCoordinator::new(config.fail_timeout_base, config.fail_timeout_max);
        let events = EventManager::new(config.events_capacity);
        Self {
            config,
            counters: SyncCounters::new(),
            channels: ChannelSyncTable::new(),
            gap_buffer: GapBuffer::new(),
            coordinator,
            store,
            events,
            no_updates_deadline: None,
        }
    }

    pub fn counters(&self) -> &SyncCounters {
        &self.counters
    }

    pub fn channel_pts(&self, channel_id: u64) -> Option<u64> {
        self.channels.get(channel_id).filter(|r| r.inited).map(|r| r.pts)
    }

    pub fn channel_requesting(&self, channel_id: u64) -> bool {
        self.channels
            .get(channel_id)
            .map(|r| r.requesting)
            .unwrap_or(false)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// 登录 / 状态拉取成功后初始化计数器
    pub fn set_state(&mut self, state: UpdatesState, now: Instant) {
        info!(
            "初始化同步状态: pts={}, qts={}, seq={}",
            state.pts, state.qts, state.seq
        );
        self.counters.init(&state);
        self.coordinator.complete_global();
        self.arm_keepalive(now);
        self.events.emit(SyncEvent::StateSynced {
            pts: self.counters.pts(),
            qts: self.counters.qts(),
            seq: self.counters.seq(),
        });
    }

    /// 从会话列表等外部来源种入频道 pts
    pub fn set_channel_state(&mut self, channel_id: u64, pts: u64) {
        self.channels.record_for(channel_id).init_pts(pts);
    }

    /// 进程从休眠恢复：放宽一次保活窗口
    pub fn resume_from_sleep(&mut self, now: Instant) {
        self.no_updates_deadline = Some(now + self.config.no_updates_after_sleep_timeout);
    }

    /// 推送信封入口
    pub fn handle_envelope(&mut self, envelope: UpdateEnvelope, now: Instant) {
        self.arm_keepalive(now);
        // 全局 difference 在途时推送信封不参与分类，其内容会被
        // difference 结果覆盖；NewSession 例外（seq 作废必须立即生效）
        if self.coordinator.requesting_global()
            && !matches!(envelope, UpdateEnvelope::NewSession)
        {
            debug!("全局 difference 在途，跳过推送信封");
            return;
        }
        self.classify(envelope, now);
    }

    /// 自己发消息的 RPC 响应里带回的更新（random_id 用于本地关联）
    pub fn handle_sent_envelope(&mut self, envelope: UpdateEnvelope, random_id: u64, now: Instant) {
        if let UpdateEnvelope::ShortSentMessage {
            id,
            pts,
            pts_count,
            date,
            ..
        } = envelope
        {
            self.arm_keepalive(now);
            self.store.confirm_sent(random_id, id);
            match check_pts(self.counters.pts(), pts, pts_count) {
                PtsCheck::Apply => {
                    self.counters.set_pts(pts);
                    self.counters.bump_date(date);
                }
                PtsCheck::Gap => {
                    info!("发送确认检测到 pts 间隙: pts={}", pts);
                    self.request_global_difference();
                }
                PtsCheck::Stale => debug!("发送确认为旧信封: pts={}", pts),
            }
            self.store.notify_changes();
        } else {
            self.handle_envelope(envelope, now);
        }
    }

    fn classify(&mut self, envelope: UpdateEnvelope, now: Instant) {
        match envelope {
            UpdateEnvelope::Single { update } => {
                self.handle_update(&update, now);
                self.store.notify_changes();
            }
            UpdateEnvelope::Combined {
                seq_start,
                seq,
                date,
                users,
                chats,
                updates,
            } => {
                if seq_start != 0 {
                    let local_seq = self.counters.seq();
                    if seq_start <= local_seq {
                        debug!("重复的 seq 批次: seq_start={}, local={}", seq_start, local_seq);
                        return;
                    }
                    if seq_start > local_seq + 1 {
                        debug!(
                            "seq 间隙，暂存批次: seq_start={}, local={}",
                            seq_start, local_seq
                        );
                        self.gap_buffer.insert(
                            seq_start,
                            UpdateEnvelope::Combined {
                                seq_start,
                                seq,
                                date,
                                users,
                                chats,
                                updates,
                            },
                            now + self.config.wait_for_skipped,
                        );
                        return;
                    }
                }

                self.store.merge_users(&users);
                self.store.merge_chats(&chats);
                for update in &updates {
                    self.handle_update(update, now);
                }
                self.apply_seq_state(date, seq, now);
                self.store.notify_changes();
            }
            UpdateEnvelope::ShortMessage {
                id,
                user_id,
                text,
                out: _,
                via_bot_id,
                fwd_from,
                entities,
                pts,
                pts_count,
                date,
            } => {
                if !self.short_message_deps_loaded(user_id, via_bot_id, &fwd_from, &entities) {
                    info!("短消息依赖缺失，发起全局 difference: user_id={}", user_id);
                    self.request_global_difference();
                    return;
                }
                let message = Message {
                    id,
                    peer: Peer::User(user_id),
                    from_id: Some(user_id),
                    post: false,
                    via_bot_id,
                    fwd_from,
                    entities,
                    date,
                    text,
                };
                self.apply_short_message(message, pts, pts_count, date, now);
            }
            UpdateEnvelope::ShortChatMessage {
                id,
                from_id,
                chat_id,
                text,
                out: _,
                via_bot_id,
                fwd_from,
                entities,
                pts,
                pts_count,
                date,
            } => {
                if !self.store.chat_loaded(chat_id)
                    || !self.short_message_deps_loaded(from_id, via_bot_id, &fwd_from, &entities)
                {
                    info!(
                        "群聊短消息依赖缺失，发起全局 difference: chat_id={}",
                        chat_id
                    );
                    self.request_global_difference();
                    return;
                }
                let message = Message {
                    id,
                    peer: Peer::Chat(chat_id),
                    from_id: Some(from_id),
                    post: false,
                    via_bot_id,
                    fwd_from,
                    entities,
                    date,
                    text,
                };
                self.apply_short_message(message, pts, pts_count, date, now);
            }
            UpdateEnvelope::ShortSentMessage {
                pts,
                pts_count,
                date,
                ..
            } => {
                // 没有 random_id 的路径只做 pts 记账
                match check_pts(self.counters.pts(), pts, pts_count) {
                    PtsCheck::Apply => {
                        self.counters.set_pts(pts);
                        self.counters.bump_date(date);
                    }
                    PtsCheck::Gap => self.request_global_difference(),
                    PtsCheck::Stale => {}
                }
            }
            UpdateEnvelope::TooLong => {
                info!("更新流落后过多（TooLong），发起全局 difference");
                self.request_global_difference();
            }
            UpdateEnvelope::NewSession => {
                info!("服务器新建会话，seq 跟踪作废，发起全局 difference");
                self.counters.reset_seq();
                self.request_global_difference();
            }
        }
    }

    fn short_message_deps_loaded(
        &self,
        from_id: u64,
        via_bot_id: Option<u64>,
        fwd_from: &Option<FwdHeader>,
        entities: &[MessageEntity],
    ) -> bool {
        if !self.store.user_loaded(from_id) {
            return false;
        }
        if let Some(bot_id) = via_bot_id {
            if !self.store.user_loaded(bot_id) {
                return false;
            }
        }
        if let Some(header) = fwd_from {
            if !deps::fwd_info_loaded(&self.store, header) {
                return false;
            }
        }
        deps::mention_users_loaded(&self.store, entities)
    }

    fn apply_short_message(
        &mut self,
        message: Message,
        pts: u64,
        pts_count: u32,
        date: i64,
        now: Instant,
    ) {
        match check_pts(self.counters.pts(), pts, pts_count) {
            PtsCheck::Apply => {
                self.store
                    .merge_messages(std::slice::from_ref(&message), MergeOrder::Unread);
                self.events.emit(SyncEvent::MessageReceived { message });
                self.counters.set_pts(pts);
                self.counters.bump_date(date);
                self.store.notify_changes();
            }
            PtsCheck::Gap => {
                info!(
                    "短消息 pts 间隙: local={}, pts={}",
                    self.counters.pts(),
                    pts
                );
                self.request_global_difference();
            }
            PtsCheck::Stale => debug!("短消息为旧信封: pts={}", pts),
        }
    }

    /// 单条更新：依赖检查 + 按所属流做 pts 检查后应用
    fn handle_update(&mut self, update: &Update, now: Instant) {
        if let Update::ChannelTooLong { channel_id, pts } = update {
            let record = self.channels.record_for(*channel_id);
            if !record.inited {
                match pts {
                    Some(pts) => record.init_pts(*pts),
                    None => {
                        debug!("未初始化频道收到 TooLong 且无 pts 提示: channel_id={}", channel_id);
                        return;
                    }
                }
            }
            record.waiting_for_skipped_gap = true;
            info!("频道落后过多，发起频道 difference: channel_id={}", channel_id);
            self.request_channel_difference(*channel_id, ChannelTrigger::Explicit);
            return;
        }

        if update.pts_info().is_none() {
            applier::apply_update(&mut self.store, &self.events, update);
            return;
        }

        // 消息负载先过依赖检查：部分应用会产生残缺展示状态
        if let Some(message) = update.message() {
            let mut missing = !deps::all_data_loaded_for_message(&self.store, message).is_ok();
            if let Some(channel_id) = update.scope_channel_id() {
                missing = missing || !self.store.channel_loaded(channel_id);
            }
            if missing {
                match update.scope_channel_id() {
                    Some(channel_id) => {
                        info!(
                            "频道消息依赖缺失，发起频道 difference: channel_id={}",
                            channel_id
                        );
                        let record = self.channels.record_for(channel_id);
                        record.waiting_for_skipped_gap = true;
                        self.request_channel_difference(channel_id, ChannelTrigger::Explicit);
                    }
                    None => {
                        info!("消息依赖缺失，发起全局 difference");
                        self.request_global_difference();
                    }
                }
                return;
            }
        }

        let (pts, pts_count) = match update.pts_info() {
            Some(info) => info,
            None => return,
        };

        match update.scope_channel_id() {
            None => match check_pts(self.counters.pts(), pts, pts_count) {
                PtsCheck::Apply => {
                    applier::apply_update(&mut self.store, &self.events, update);
                    self.counters.set_pts(pts);
                }
                PtsCheck::Gap => {
                    info!(
                        "全局 pts 间隙: local={}, pts={}, count={}",
                        self.counters.pts(),
                        pts,
                        pts_count
                    );
                    self.request_global_difference();
                }
                PtsCheck::Stale => debug!("旧更新已忽略: pts={}", pts),
            },
            Some(channel_id) => {
                let record = self.channels.record_for(channel_id);
                if !record.inited {
                    // 首次见到该频道：以当前信封的 pts 作为基准
                    record.init_pts(pts);
                    applier::apply_update(&mut self.store, &self.events, update);
                    return;
                }
                match check_pts(record.pts, pts, pts_count) {
                    PtsCheck::Apply => {
                        record.pts = pts;
                        applier::apply_update(&mut self.store, &self.events, update);
                    }
                    PtsCheck::Gap => {
                        info!(
                            "频道 pts 间隙: channel_id={}, local={}, pts={}",
                            channel_id, record.pts, pts
                        );
                        record.waiting_for_skipped_gap = true;
                        let deadline = now + self.config.wait_for_skipped;
                        self.coordinator.schedule_channel_by_pts(channel_id, deadline);
                    }
                    PtsCheck::Stale => {
                        debug!("频道旧更新已忽略: channel_id={}, pts={}", channel_id, pts)
                    }
                }
            }
        }
    }

    /// seq / date 收尾：date 单调推进，seq 推进后释放缓冲中连续的后继
    fn apply_seq_state(&mut self, date: i64, seq: u64, now: Instant) {
        self.counters.bump_date(date);
        if seq != 0 {
            self.counters.advance_seq(seq);
            while let Some(envelope) = self.gap_buffer.release_next(self.counters.seq()) {
                debug!("释放 seq 缓冲批次");
                self.classify(envelope, now);
            }
            self.gap_buffer.rearm(now + self.config.wait_for_skipped);
        }
    }

    // ============================================================
    // difference 触发与回灌
    // ============================================================

    /// 发起全局 difference（在途则合并触发）
    pub fn request_global_difference(&mut self) {
        if !self.coordinator.begin_global(
            self.counters.pts(),
            self.counters.qts(),
            self.counters.date(),
        ) {
            return;
        }
        info!("发起全局 difference: pts={}", self.counters.pts());
        // 全量在途期间 seq 缓冲作废，保活探测暂停
        self.gap_buffer.clear();
        self.no_updates_deadline = None;
    }

    /// 发起频道 difference
    pub fn request_channel_difference(&mut self, channel_id: u64, trigger: ChannelTrigger) {
        let limit = self.config.channel_difference_limit;
        let record = self.channels.record_for(channel_id);
        if self
            .coordinator
            .begin_channel(channel_id, record, trigger, limit)
        {
            debug!("发起频道 difference: channel_id={}", channel_id);
        }
    }

    /// 取走待执行的网络请求（驱动层消费）
    pub fn take_pending_requests(&mut self) -> Vec<PendingRequest> {
        self.coordinator.take_pending()
    }

    /// 全局 difference 成功回灌
    pub fn apply_difference(&mut self, difference: Difference, now: Instant) {
        match difference {
            Difference::Empty { date, seq } => {
                debug!("difference empty: seq={}", seq);
                self.counters.bump_date(date);
                self.counters.advance_seq(seq);
                self.coordinator.complete_global();
                self.arm_keepalive(now);
                self.emit_state_synced();
            }
            Difference::Slice {
                new_messages,
                other_updates,
                users,
                chats,
                intermediate_state,
            } => {
                self.feed_difference(&users, &chats, &new_messages, &other_updates, now);
                self.counters.init(&intermediate_state);
                self.coordinator.complete_global();
                info!(
                    "difference slice 已应用: pts={}，继续拉取",
                    intermediate_state.pts
                );
                self.request_global_difference();
            }
            Difference::Full {
                new_messages,
                other_updates,
                users,
                chats,
                state,
            } => {
                self.feed_difference(&users, &chats, &new_messages, &other_updates, now);
                self.counters.init(&state);
                self.coordinator.complete_global();
                info!("difference 完成: pts={}", state.pts);
                self.arm_keepalive(now);
                self.emit_state_synced();
            }
            Difference::TooLong { pts } => {
                // 增量结构上无法解析：这是引擎唯一向外升级的出口
                error!("difference too long（协议不支持），强制会话重置: pts={}", pts);
                self.coordinator.complete_global();
                self.events.emit(SyncEvent::ForceReset);
            }
        }
    }

    /// 全局 difference 失败回灌
    pub fn fail_difference(&mut self, error: TransportError, now: Instant) {
        if error.default_handled() {
            debug!("difference 失败已由传输层处理: {}", error);
            return;
        }
        warn!("difference 失败: {}", error);
        self.coordinator.fail_global(now);
    }

    /// 频道 difference 成功回灌
    pub fn apply_channel_difference(
        &mut self,
        channel_id: u64,
        difference: ChannelDifference,
        now: Instant,
    ) {
        let (pts, is_final, timeout) = match difference {
            ChannelDifference::Empty {
                pts,
                is_final,
                timeout,
            } => (pts, is_final, timeout),
            ChannelDifference::TooLong {
                pts,
                is_final,
                timeout,
                users,
                chats,
                messages,
            } => {
                self.store.merge_users(&users);
                self.store.merge_chats(&chats);
                // 历史尾部整体替换
                self.store.merge_messages(&messages, MergeOrder::Last);
                (pts, is_final, timeout)
            }
            ChannelDifference::Diff {
                pts,
                is_final,
                timeout,
                new_messages,
                other_updates,
                users,
                chats,
            } => {
                self.store.merge_users(&users);
                self.store.merge_chats(&chats);
                self.store.merge_messages(&new_messages, MergeOrder::Unread);
                for update in &other_updates {
                    applier::apply_update(&mut self.store, &self.events, update);
                }
                (pts, is_final, timeout)
            }
        };

        let record = self.channels.record_for(channel_id);
        record.init_pts(pts);
        self.coordinator.complete_channel(channel_id, record);
        self.events.emit(SyncEvent::ChannelSynced { channel_id, pts });
        self.store.notify_changes();

        if !is_final {
            info!(
                "频道 difference 未到终态，继续拉取: channel_id={}",
                channel_id
            );
            self.request_channel_difference(channel_id, ChannelTrigger::Explicit);
        } else {
            // 到期做一次轻量 short poll 检查；服务器未给 timeout 时用默认间隔
            let delay = timeout
                .map(std::time::Duration::from_secs)
                .unwrap_or(self.config.channel_short_poll_timeout);
            self.coordinator.schedule_channel_by_pts(channel_id, now + delay);
        }
    }

    /// 频道 difference 失败回灌
    pub fn fail_channel_difference(
        &mut self,
        channel_id: u64,
        error: TransportError,
        now: Instant,
    ) {
        if error.default_handled() {
            debug!(
                "频道 difference 失败已由传输层处理: channel_id={}",
                channel_id
            );
            return;
        }
        let record = self.channels.record_for(channel_id);
        self.coordinator.fail_channel(channel_id, record, now);
    }

    fn feed_difference(
        &mut self,
        users: &[crate::protocol::User],
        chats: &[crate::protocol::Chat],
        new_messages: &[Message],
        other_updates: &[Update],
        now: Instant,
    ) {
        self.store.merge_users(users);
        self.store.merge_chats(chats);
        self.store.merge_messages(new_messages, MergeOrder::Unread);
        for update in other_updates {
            // 计数器由内嵌状态整体替换，这里不再做 pts 检查
            if let Update::ChannelTooLong { .. } = update {
                self.handle_update(update, now);
            } else {
                applier::apply_update(&mut self.store, &self.events, update);
            }
        }
        self.store.notify_changes();
    }

    fn emit_state_synced(&self) {
        self.events.emit(SyncEvent::StateSynced {
            pts: self.counters.pts(),
            qts: self.counters.qts(),
            seq: self.counters.seq(),
        });
    }

    // ============================================================
    // 定时
    // ============================================================

    fn arm_keepalive(&mut self, now: Instant) {
        if self.coordinator.requesting_global() {
            return;
        }
        self.no_updates_deadline = Some(now + self.config.no_updates_timeout);
    }

    /// 所有定时中最近的期限（驱动层据此休眠）
    pub fn next_deadline(&self) -> Option<Instant> {
        let candidates = [
            self.gap_buffer.deadline(),
            self.coordinator.next_deadline(),
            self.no_updates_deadline,
        ];
        candidates.into_iter().flatten().min()
    }

    /// 驱动到期的定时器
    pub fn handle_time(&mut self, now: Instant) {
        if let Some(deadline) = self.gap_buffer.deadline() {
            if deadline <= now {
                warn!(
                    "seq 间隙等待超时，丢弃 {} 条缓冲并强制全量 difference",
                    self.gap_buffer.len()
                );
                self.gap_buffer.clear();
                self.request_global_difference();
            }
        }

        if self.coordinator.take_global_after_fail_due(now) {
            info!("全局 difference 退避到期，重试");
            self.request_global_difference();
        }

        for channel_id in self.coordinator.take_due_channel_by_pts(now) {
            self.request_channel_difference(channel_id, ChannelTrigger::PtsGapOrShortPoll);
        }

        for channel_id in self.coordinator.take_due_channel_after_fail(now) {
            self.channels.mark_requesting(channel_id, false);
            self.request_channel_difference(channel_id, ChannelTrigger::AfterFail);
        }

        if let Some(deadline) = self.no_updates_deadline {
            if deadline <= now {
                info!("保活窗口内无任何更新，发送探测");
                self.coordinator.push_probe();
                self.arm_keepalive(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn engine_at(pts: u64) -> (SyncEngine<MemoryStore>, Instant) {
        let mut store = MemoryStore::new();
        store.insert_user(1, "alice");
        store.insert_chat(5, "group", false);
        store.insert_chat(7, "channel", true);
        let mut engine = SyncEngine::new(store, SyncConfig::default());
        let now = Instant::now();
        engine.set_state(
            UpdatesState {
                pts,
                qts: 0,
                seq: 2,
                date: 1000,
            },
            now,
        );
        (engine, now)
    }

    fn message(id: u64, peer: Peer, from: u64) -> Message {
        Message {
            id,
            peer,
            from_id: Some(from),
            post: false,
            via_bot_id: None,
            fwd_from: None,
            entities: Vec::new(),
            date: 2000,
            text: format!("m{}", id),
        }
    }

    fn new_message(id: u64, pts: u64) -> UpdateEnvelope {
        UpdateEnvelope::Single {
            update: Update::NewMessage {
                message: message(id, Peer::User(1), 1),
                pts,
                pts_count: 1,
            },
        }
    }

    fn combined(seq: u64, updates: Vec<Update>) -> UpdateEnvelope {
        UpdateEnvelope::Combined {
            seq_start: seq,
            seq,
            date: 2000,
            users: Vec::new(),
            chats: Vec::new(),
            updates,
        }
    }

    #[test]
    fn test_contiguous_pts_applied() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(new_message(1, 101), now);
        assert_eq!(engine.counters().pts(), 101);
        assert!(engine.store().has_message(None, 1));
        assert!(engine.take_pending_requests().is_empty());
    }

    #[test]
    fn test_stale_pts_dropped() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(new_message(1, 100), now);
        assert_eq!(engine.counters().pts(), 100);
        assert!(!engine.store().has_message(None, 1));
        assert!(engine.take_pending_requests().is_empty());
    }

    #[test]
    fn test_gap_triggers_single_difference_request() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(new_message(2, 105), now);
        // 后续再多的间隙信封也不会重复发起
        engine.handle_envelope(new_message(3, 106), now);
        engine.handle_envelope(new_message(4, 107), now);

        let requests = engine.take_pending_requests();
        assert_eq!(
            requests,
            vec![PendingRequest::FullDifference {
                pts: 100,
                qts: 0,
                date: 1000,
            }]
        );
        assert_eq!(engine.counters().pts(), 100);
        assert!(!engine.store().has_message(None, 2));
    }

    #[test]
    fn test_end_to_end_gap_recovery() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(new_message(1, 101), now);
        assert_eq!(engine.counters().pts(), 101);

        engine.handle_envelope(new_message(2, 105), now);
        let requests = engine.take_pending_requests();
        assert_eq!(requests.len(), 1);

        engine.apply_difference(
            Difference::Full {
                new_messages: vec![message(2, Peer::User(1), 1)],
                other_updates: Vec::new(),
                users: Vec::new(),
                chats: Vec::new(),
                state: UpdatesState {
                    pts: 105,
                    qts: 0,
                    seq: 2,
                    date: 2000,
                },
            },
            now,
        );
        assert_eq!(engine.counters().pts(), 105);
        assert!(engine.store().has_message(None, 2));
        assert!(engine.take_pending_requests().is_empty());
    }

    #[test]
    fn test_envelopes_ignored_while_requesting() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(new_message(2, 105), now);
        engine.take_pending_requests();

        // 在途期间到达的本可应用的信封也被跳过（difference 会带回）
        engine.handle_envelope(new_message(9, 101), now);
        assert!(!engine.store().has_message(None, 9));
        assert_eq!(engine.counters().pts(), 100);
    }

    #[test]
    fn test_missing_dependency_is_a_gap() {
        let (mut engine, now) = engine_at(100);
        // 发送者 999 未加载，pts 本来恰好衔接
        let envelope = UpdateEnvelope::Single {
            update: Update::NewMessage {
                message: message(1, Peer::User(999), 999),
                pts: 101,
                pts_count: 1,
            },
        };
        engine.handle_envelope(envelope, now);
        assert!(!engine.store().has_message(None, 1));
        assert_eq!(engine.counters().pts(), 100);
        assert_eq!(engine.take_pending_requests().len(), 1);
    }

    #[test]
    fn test_short_message_applies_and_bumps_date() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(
            UpdateEnvelope::ShortMessage {
                id: 11,
                user_id: 1,
                text: "hi".to_string(),
                out: false,
                via_bot_id: None,
                fwd_from: None,
                entities: Vec::new(),
                pts: 101,
                pts_count: 1,
                date: 3000,
            },
            now,
        );
        assert_eq!(engine.counters().pts(), 101);
        assert_eq!(engine.counters().date(), 3000);
        assert!(engine.store().has_message(None, 11));
    }

    #[test]
    fn test_short_message_unknown_sender_requests_difference() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(
            UpdateEnvelope::ShortMessage {
                id: 11,
                user_id: 42,
                text: "hi".to_string(),
                out: false,
                via_bot_id: None,
                fwd_from: None,
                entities: Vec::new(),
                pts: 101,
                pts_count: 1,
                date: 3000,
            },
            now,
        );
        assert!(!engine.store().has_message(None, 11));
        assert_eq!(engine.take_pending_requests().len(), 1);
    }

    #[test]
    fn test_seq_reordering() {
        let (mut engine, now) = engine_at(100);
        let status = |user_id| Update::UserStatus {
            user_id,
            online: true,
        };
        // localSeq=2，到达顺序 5、3、4，应用后 seq=5 且缓冲清空
        engine.handle_envelope(combined(5, vec![status(1)]), now);
        assert_eq!(engine.counters().seq(), 2);
        engine.handle_envelope(combined(3, vec![status(1)]), now);
        assert_eq!(engine.counters().seq(), 3);
        engine.handle_envelope(combined(4, vec![status(1)]), now);
        assert_eq!(engine.counters().seq(), 5);
        assert!(engine.take_pending_requests().is_empty());
        assert!(engine.next_deadline().is_some()); // 只剩保活
    }

    #[test]
    fn test_duplicate_seq_dropped() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(
            combined(
                2,
                vec![Update::NewMessage {
                    message: message(1, Peer::User(1), 1),
                    pts: 101,
                    pts_count: 1,
                }],
            ),
            now,
        );
        assert!(!engine.store().has_message(None, 1));
        assert_eq!(engine.counters().pts(), 100);
    }

    #[test]
    fn test_seq_gap_timeout_forces_difference() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(combined(5, Vec::new()), now);
        assert!(engine.take_pending_requests().is_empty());

        engine.handle_time(now + Duration::from_secs(2));
        let requests = engine.take_pending_requests();
        assert_eq!(requests.len(), 1);
        assert!(matches!(
            requests[0],
            PendingRequest::FullDifference { .. }
        ));
    }

    #[test]
    fn test_seq_gap_wait_not_extended_by_more_batches() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(combined(5, Vec::new()), now);
        // 又一条乱序批次不能重置等待计时
        engine.handle_envelope(combined(7, Vec::new()), now + Duration::from_millis(900));

        engine.handle_time(now + Duration::from_millis(1100));
        let requests = engine.take_pending_requests();
        assert!(matches!(
            requests.as_slice(),
            [PendingRequest::FullDifference { .. }]
        ));
    }

    #[test]
    fn test_too_long_and_new_session() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(UpdateEnvelope::TooLong, now);
        assert_eq!(engine.take_pending_requests().len(), 1);

        engine.apply_difference(
            Difference::Empty {
                date: 1000,
                seq: 2,
            },
            now,
        );
        engine.handle_envelope(UpdateEnvelope::NewSession, now);
        assert_eq!(engine.counters().seq(), 0);
        assert_eq!(engine.take_pending_requests().len(), 1);
    }

    #[test]
    fn test_channel_gap_is_isolated() {
        let (mut engine, now) = engine_at(100);
        engine.set_channel_state(7, 50);
        engine.set_channel_state(8, 60);

        let envelope = UpdateEnvelope::Single {
            update: Update::NewChannelMessage {
                channel_id: 7,
                message: message(1, Peer::Channel(7), 1),
                pts: 55,
                pts_count: 1,
            },
        };
        engine.handle_envelope(envelope, now);

        // 间隙只影响频道 7：不发全局请求，频道 8 原样
        assert!(engine.take_pending_requests().is_empty());
        assert_eq!(engine.counters().pts(), 100);
        assert_eq!(engine.channel_pts(8), Some(60));

        // 短延迟到期后只有频道 7 的请求，带 force
        engine.handle_time(now + Duration::from_secs(1));
        let requests = engine.take_pending_requests();
        assert_eq!(
            requests,
            vec![PendingRequest::ChannelDifference {
                channel_id: 7,
                pts: 50,
                force: true,
                limit: 100,
            }]
        );
    }

    #[test]
    fn test_channel_contiguous_applies() {
        let (mut engine, now) = engine_at(100);
        engine.set_channel_state(7, 50);
        engine.handle_envelope(
            UpdateEnvelope::Single {
                update: Update::NewChannelMessage {
                    channel_id: 7,
                    message: message(3, Peer::Channel(7), 1),
                    pts: 51,
                    pts_count: 1,
                },
            },
            now,
        );
        assert_eq!(engine.channel_pts(7), Some(51));
        assert!(engine.store().has_message(Some(7), 3));
        // 全局计数器不受频道流影响
        assert_eq!(engine.counters().pts(), 100);
    }

    #[test]
    fn test_channel_difference_non_final_continues() {
        let (mut engine, now) = engine_at(100);
        engine.set_channel_state(7, 50);
        engine.request_channel_difference(7, ChannelTrigger::Explicit);
        assert_eq!(engine.take_pending_requests().len(), 1);

        engine.apply_channel_difference(
            7,
            ChannelDifference::Diff {
                pts: 60,
                is_final: false,
                timeout: None,
                new_messages: vec![message(4, Peer::Channel(7), 1)],
                other_updates: Vec::new(),
                users: Vec::new(),
                chats: Vec::new(),
            },
            now,
        );
        assert_eq!(engine.channel_pts(7), Some(60));
        assert!(engine.store().has_message(Some(7), 4));
        // 未到终态，立即续拉
        let requests = engine.take_pending_requests();
        assert_eq!(requests.len(), 1);
        assert!(matches!(
            requests[0],
            PendingRequest::ChannelDifference { pts: 60, force: false, .. }
        ));
    }

    #[test]
    fn test_channel_difference_timeout_schedules_short_poll() {
        let (mut engine, now) = engine_at(100);
        engine.set_channel_state(7, 50);
        engine.request_channel_difference(7, ChannelTrigger::Explicit);
        engine.take_pending_requests();

        engine.apply_channel_difference(
            7,
            ChannelDifference::Empty {
                pts: 50,
                is_final: true,
                timeout: Some(5),
            },
            now,
        );
        assert!(engine.take_pending_requests().is_empty());

        engine.handle_time(now + Duration::from_secs(5));
        let requests = engine.take_pending_requests();
        assert_eq!(requests.len(), 1);
        // short poll 不带 force
        assert!(matches!(
            requests[0],
            PendingRequest::ChannelDifference { force: false, .. }
        ));
    }

    #[test]
    fn test_channel_too_long_difference_adopts_pts() {
        let (mut engine, now) = engine_at(100);
        engine.set_channel_state(7, 50);
        engine.request_channel_difference(7, ChannelTrigger::Explicit);
        engine.take_pending_requests();

        // 本地落后过多：最近一段消息整体替换，pts 直接采纳
        engine.apply_channel_difference(
            7,
            ChannelDifference::TooLong {
                pts: 200,
                is_final: true,
                timeout: None,
                users: Vec::new(),
                chats: Vec::new(),
                messages: vec![message(21, Peer::Channel(7), 1), message(22, Peer::Channel(7), 1)],
            },
            now,
        );
        assert_eq!(engine.channel_pts(7), Some(200));
        assert!(engine.store().has_message(Some(7), 21));
        assert!(engine.store().has_message(Some(7), 22));
        assert!(!engine.channel_requesting(7));

        // 采纳后的连续信封正常衔接
        engine.handle_envelope(
            UpdateEnvelope::Single {
                update: Update::NewChannelMessage {
                    channel_id: 7,
                    message: message(23, Peer::Channel(7), 1),
                    pts: 201,
                    pts_count: 1,
                },
            },
            now,
        );
        assert_eq!(engine.channel_pts(7), Some(201));
    }

    #[test]
    fn test_channel_too_long_update_requests_difference() {
        let (mut engine, now) = engine_at(100);
        engine.set_channel_state(7, 50);
        engine.handle_envelope(
            UpdateEnvelope::Single {
                update: Update::ChannelTooLong {
                    channel_id: 7,
                    pts: None,
                },
            },
            now,
        );
        let requests = engine.take_pending_requests();
        assert_eq!(
            requests,
            vec![PendingRequest::ChannelDifference {
                channel_id: 7,
                pts: 50,
                force: true,
                limit: 100,
            }]
        );
    }

    #[test]
    fn test_channel_too_long_seeds_uninited_record_from_hint() {
        let (mut engine, now) = engine_at(100);

        // 无 pts 提示且记录未初始化：没有基准，不能发请求
        engine.handle_envelope(
            UpdateEnvelope::Single {
                update: Update::ChannelTooLong {
                    channel_id: 8,
                    pts: None,
                },
            },
            now,
        );
        assert!(engine.take_pending_requests().is_empty());

        // 带 pts 提示：以提示为基准初始化并发起请求
        engine.handle_envelope(
            UpdateEnvelope::Single {
                update: Update::ChannelTooLong {
                    channel_id: 8,
                    pts: Some(80),
                },
            },
            now,
        );
        assert_eq!(
            engine.take_pending_requests(),
            vec![PendingRequest::ChannelDifference {
                channel_id: 8,
                pts: 80,
                force: true,
                limit: 100,
            }]
        );
    }

    #[test]
    fn test_channel_short_poll_uses_default_interval() {
        let (mut engine, now) = engine_at(100);
        engine.set_channel_state(7, 50);
        engine.request_channel_difference(7, ChannelTrigger::Explicit);
        engine.take_pending_requests();

        // 服务器未给 timeout：用配置的默认 short poll 间隔
        engine.apply_channel_difference(
            7,
            ChannelDifference::Empty {
                pts: 50,
                is_final: true,
                timeout: None,
            },
            now,
        );
        assert!(engine.take_pending_requests().is_empty());
        engine.handle_time(now + Duration::from_secs(29));
        assert!(!engine
            .take_pending_requests()
            .iter()
            .any(|r| matches!(r, PendingRequest::ChannelDifference { .. })));

        engine.handle_time(now + Duration::from_secs(30));
        let requests = engine.take_pending_requests();
        assert!(matches!(
            requests.as_slice(),
            [PendingRequest::ChannelDifference { force: false, .. }]
        ));
    }

    #[test]
    fn test_channel_backoff_and_retry() {
        let (mut engine, now) = engine_at(100);
        engine.set_channel_state(7, 50);
        engine.request_channel_difference(7, ChannelTrigger::Explicit);
        engine.take_pending_requests();

        engine.fail_channel_difference(7, TransportError::Timeout, now);
        // 退避期间仍视为在途，新触发被合并
        engine.request_channel_difference(7, ChannelTrigger::Explicit);
        assert!(engine.take_pending_requests().is_empty());

        engine.handle_time(now + Duration::from_secs(1));
        let requests = engine.take_pending_requests();
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_default_handled_failures_ignored() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(new_message(2, 105), now);
        engine.take_pending_requests();

        engine.fail_difference(
            TransportError::DefaultHandled("flood wait".to_string()),
            now,
        );
        // 不安排退避重试
        engine.handle_time(now + Duration::from_secs(70));
        let requests = engine.take_pending_requests();
        assert!(!requests
            .iter()
            .any(|r| matches!(r, PendingRequest::FullDifference { .. })));
    }

    #[test]
    fn test_force_reset_on_unresolvable_difference() {
        let (mut engine, now) = engine_at(100);
        let mut rx = engine.subscribe_events();
        engine.handle_envelope(new_message(2, 105), now);
        engine.take_pending_requests();

        engine.apply_difference(Difference::TooLong { pts: 200 }, now);
        let mut saw_reset = false;
        while let Ok(event) = rx.try_recv() {
            if event == SyncEvent::ForceReset {
                saw_reset = true;
            }
        }
        assert!(saw_reset);
    }

    #[test]
    fn test_keepalive_probe_after_quiet_window() {
        let (mut engine, now) = engine_at(100);
        engine.handle_time(now + Duration::from_secs(16));
        let requests = engine.take_pending_requests();
        assert_eq!(requests, vec![PendingRequest::LivenessProbe]);
    }

    #[test]
    fn test_keepalive_suspended_while_requesting() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(new_message(2, 105), now);
        engine.take_pending_requests();

        // 在途期间不发保活探测，请求本身就是活性证明
        engine.handle_time(now + Duration::from_secs(20));
        assert!(engine.take_pending_requests().is_empty());

        // 完成后窗口重新拉起
        engine.apply_difference(
            Difference::Empty {
                date: 1000,
                seq: 2,
            },
            now + Duration::from_secs(20),
        );
        engine.handle_time(now + Duration::from_secs(36));
        assert_eq!(
            engine.take_pending_requests(),
            vec![PendingRequest::LivenessProbe]
        );
    }

    #[test]
    fn test_resume_from_sleep_extends_window() {
        let (mut engine, now) = engine_at(100);
        engine.resume_from_sleep(now);
        engine.handle_time(now + Duration::from_secs(16));
        assert!(engine.take_pending_requests().is_empty());
        engine.handle_time(now + Duration::from_secs(31));
        assert_eq!(
            engine.take_pending_requests(),
            vec![PendingRequest::LivenessProbe]
        );
    }

    #[test]
    fn test_sent_confirmation_applies() {
        let (mut engine, now) = engine_at(100);
        engine.handle_sent_envelope(
            UpdateEnvelope::ShortSentMessage {
                id: 500,
                entities: Vec::new(),
                pts: 101,
                pts_count: 1,
                date: 2500,
            },
            777,
            now,
        );
        assert_eq!(engine.counters().pts(), 101);
        assert_eq!(engine.store().sent_confirmation(777), Some(500));
    }

    #[test]
    fn test_date_never_decreases_on_apply() {
        let (mut engine, now) = engine_at(100);
        engine.handle_envelope(
            UpdateEnvelope::Combined {
                seq_start: 3,
                seq: 3,
                date: 500, // 早于已知 date=1000
                users: Vec::new(),
                chats: Vec::new(),
                updates: Vec::new(),
            },
            now,
        );
        assert_eq!(engine.counters().date(), 1000);
        assert_eq!(engine.counters().seq(), 3);
    }
}
